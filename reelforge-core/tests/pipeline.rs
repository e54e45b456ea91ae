use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::mpsc;

use reelforge_core::{
    load_pipeline_config, BroadcastChannel, ChannelMessage, CommandExecutor, JobRecordStore,
    JobScheduler, JobStatus, PipelineConfig, SqliteJobStore, StatusPublisher, TranscodeJob,
    TranscodeOrchestrator, WatermarkAssetManager, MASTER_PLAYLIST_NAME, PROGRESS_EVENT,
    STATUS_EVENT,
};

const VALID_PROBE_REPORT: &str = r#"{
    "format": {"duration": "10.000000"},
    "streams": [
        {"codec_type": "video", "width": 1920, "height": 1080, "r_frame_rate": "30/1"},
        {"codec_type": "audio"}
    ]
}"#;

const AUDIO_ONLY_PROBE_REPORT: &str = r#"{
    "format": {"duration": "10.000000"},
    "streams": [{"codec_type": "audio"}]
}"#;

/// Stands in for ffmpeg/ffprobe: recognises each pipeline invocation by its
/// arguments, materialises the files the real binary would write, and feeds
/// a scripted progress stream back to the orchestrator.
struct ScriptedExecutor {
    probe_report: String,
    fail_transcode: bool,
    asset_generations: AtomicUsize,
    streamed_commands: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    fn new(probe_report: &str) -> Self {
        Self {
            probe_report: probe_report.to_string(),
            fail_transcode: false,
            asset_generations: AtomicUsize::new(0),
            streamed_commands: Mutex::new(Vec::new()),
        }
    }

    fn failing_transcode(probe_report: &str) -> Self {
        Self {
            fail_transcode: true,
            ..Self::new(probe_report)
        }
    }
}

fn command_args(command: &Command) -> Vec<String> {
    command
        .as_std()
        .get_args()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect()
}

fn success() -> ExitStatus {
    ExitStatus::from_raw(0)
}

fn failure() -> ExitStatus {
    // Unix wait status encoding: exit code 1.
    ExitStatus::from_raw(256)
}

fn output(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Output {
    Output {
        status,
        stdout,
        stderr,
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let args = command_args(command);
        if args.iter().any(|arg| arg == "-show_streams") {
            return Ok(output(success(), self.probe_report.clone().into_bytes(), vec![]));
        }
        if args.iter().any(|arg| arg.starts_with("color=")) {
            // Watermark placeholder generation; the logo path is the final arg.
            self.asset_generations.fetch_add(1, Ordering::SeqCst);
            let logo = args.last().expect("logo path argument");
            std::fs::write(logo, b"png placeholder")?;
            return Ok(output(success(), vec![], vec![]));
        }
        if args.iter().any(|arg| arg == "-frames:v") {
            // Thumbnail candidate extraction; the frame path is the final arg.
            let frame = args.last().expect("frame path argument");
            std::fs::write(frame, b"png frame")?;
            return Ok(output(success(), vec![], vec![]));
        }
        panic!("unexpected command: {args:?}");
    }

    async fn run_streaming(
        &self,
        command: &mut Command,
        lines: mpsc::Sender<String>,
    ) -> std::io::Result<Output> {
        let args = command_args(command);
        self.streamed_commands.lock().unwrap().push(args.clone());
        if self.fail_transcode {
            return Ok(output(failure(), vec![], b"scripted encoder failure".to_vec()));
        }

        for micros in ["2500000", "5000000", "7500000", "10000000"] {
            let _ = lines.send(format!("out_time_us={micros}")).await;
        }
        let _ = lines.send("progress=end".to_string()).await;

        // Materialise what the segmenter would have written.
        let playlist_template = args.last().expect("playlist template argument");
        let output_dir = Path::new(playlist_template)
            .parent()
            .expect("playlist template has a parent");
        let map_index = args
            .iter()
            .position(|arg| arg == "-var_stream_map")
            .expect("var_stream_map present");
        for entry in args[map_index + 1].split_whitespace() {
            let name = entry
                .split(',')
                .find_map(|part| part.strip_prefix("name:"))
                .expect("variant name");
            std::fs::write(
                output_dir.join(format!("{name}.m3u8")),
                format!("#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n{name}_00001.ts\n#EXT-X-ENDLIST\n"),
            )?;
            std::fs::write(output_dir.join(format!("{name}_00001.ts")), b"segment")?;
        }
        Ok(output(success(), vec![], vec![]))
    }
}

struct Harness {
    scheduler: JobScheduler,
    store: Arc<dyn JobRecordStore>,
    channel: Arc<BroadcastChannel>,
    config: Arc<PipelineConfig>,
    base: TempDir,
}

fn harness(executor: Arc<ScriptedExecutor>) -> Harness {
    let base = TempDir::new().unwrap();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml");
    let mut config = load_pipeline_config(path).expect("fixture config should parse");
    config.paths.base_dir = base.path().to_string_lossy().to_string();
    config.retry.base_delay_seconds = 1;
    let config = Arc::new(config);

    let store = SqliteJobStore::builder()
        .path(base.path().join("jobs.sqlite"))
        .build()
        .unwrap();
    store.initialize().unwrap();
    let store: Arc<dyn JobRecordStore> = Arc::new(store);
    let channel = Arc::new(BroadcastChannel::default());
    let publisher = Arc::new(StatusPublisher::new(store.clone(), channel.clone()));
    let orchestrator = Arc::new(TranscodeOrchestrator::new(
        config.clone(),
        executor,
        publisher.clone(),
    ));
    let scheduler = JobScheduler::new(orchestrator, store.clone(), publisher, config.clone())
        .unwrap();
    Harness {
        scheduler,
        store,
        channel,
        config,
        base,
    }
}

impl Harness {
    fn write_input(&self, name: &str) -> PathBuf {
        let path = self.base.path().join(name);
        std::fs::write(&path, b"raw upload").unwrap();
        path
    }

    fn output_dir(&self, job_id: &str) -> PathBuf {
        self.config
            .resolve_path(&self.config.paths.storage_dir)
            .join(job_id)
    }

    async fn wait_until_idle(&self) {
        while !self.scheduler.is_idle() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn drain_events(
    receiver: &mut tokio::sync::broadcast::Receiver<ChannelMessage>,
) -> Vec<ChannelMessage> {
    let mut events = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        events.push(message);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn happy_path_produces_manifest_thumbnail_and_progress() {
    let executor = Arc::new(ScriptedExecutor::new(VALID_PROBE_REPORT));
    let harness = harness(executor.clone());
    let input = harness.write_input("raw.mp4");
    let mut events = harness.channel.subscribe();

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", &input, "alice"))
        .unwrap();
    harness.wait_until_idle().await;

    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Ready);
    assert_eq!(record.progress_percent, 100);
    assert_eq!(record.retry_count, 0);

    let output_dir = harness.output_dir("abc123");
    let master = std::fs::read_to_string(output_dir.join(MASTER_PLAYLIST_NAME)).unwrap();
    let variants: Vec<&str> = master
        .lines()
        .filter(|line| line.starts_with("#EXT-X-STREAM-INF"))
        .collect();
    assert_eq!(variants.len(), 3);
    assert!(master.contains("1080p.m3u8"));
    assert!(output_dir.join("1080p.m3u8").exists());
    assert!(output_dir.join("720p.m3u8").exists());
    assert!(output_dir.join("480p.m3u8").exists());
    assert!(output_dir.join("poster.png").exists());

    let checksums: serde_json::Value =
        serde_json::from_slice(&std::fs::read(output_dir.join("checksums.json")).unwrap())
            .unwrap();
    assert!(checksums.get("master.m3u8").is_some());
    assert!(checksums.get("1080p_00001.ts").is_some());

    // Watermark bootstrap ran exactly once and the encode burned in the
    // owner handle.
    assert_eq!(executor.asset_generations.load(Ordering::SeqCst), 1);
    let streamed = executor.streamed_commands.lock().unwrap();
    assert_eq!(streamed.len(), 1);
    let joined = streamed[0].join(" ");
    assert!(joined.contains("drawtext"));
    assert!(joined.contains("@alice"));
    drop(streamed);

    // Published progress is monotonically non-decreasing and ends at 100.
    let events = drain_events(&mut events).await;
    let progress: Vec<u64> = events
        .iter()
        .filter(|event| event.event == PROGRESS_EVENT)
        .map(|event| event.payload["progress"].as_u64().unwrap())
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*progress.last().unwrap(), 100);
    let status_events: Vec<&ChannelMessage> = events
        .iter()
        .filter(|event| event.event == STATUS_EVENT)
        .collect();
    assert_eq!(status_events.len(), 1);
    assert_eq!(status_events[0].payload["status"], "ready");
}

#[tokio::test(start_paused = true)]
async fn input_without_video_stream_fails_without_artifacts() {
    let executor = Arc::new(ScriptedExecutor::new(AUDIO_ONLY_PROBE_REPORT));
    let harness = harness(executor);
    let input = harness.write_input("audio.mp4");

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", &input, "alice"))
        .unwrap();
    harness.wait_until_idle().await;

    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.error.as_deref().unwrap().contains("no video stream"));
    assert!(record.manifest_path.is_none());
    assert!(!harness.output_dir("abc123").exists());
}

#[tokio::test(start_paused = true)]
async fn transcode_failure_is_retried_then_surfaced() {
    let executor = Arc::new(ScriptedExecutor::failing_transcode(VALID_PROBE_REPORT));
    let harness = harness(executor.clone());
    let input = harness.write_input("raw.mp4");

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", &input, "alice"))
        .unwrap();
    harness.wait_until_idle().await;

    assert_eq!(executor.streamed_commands.lock().unwrap().len(), 3);
    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .unwrap()
        .contains("transcoder exited with status 1"));
    // Partial outputs from the failed attempts are purged.
    assert!(!harness.output_dir("abc123").exists());
}

#[tokio::test(start_paused = true)]
async fn concurrent_asset_bootstrap_generates_once() {
    let base = TempDir::new().unwrap();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml");
    let mut config = load_pipeline_config(path).unwrap();
    config.paths.base_dir = base.path().to_string_lossy().to_string();
    let config = Arc::new(config);

    let executor = Arc::new(ScriptedExecutor::new(VALID_PROBE_REPORT));
    let manager = Arc::new(WatermarkAssetManager::new(config.clone(), executor.clone()));

    let (left, right) = tokio::join!(manager.ensure(), manager.ensure());
    let left = left.unwrap();
    let right = right.unwrap();
    assert_eq!(left.logo_path, right.logo_path);
    assert!(left.logo_path.exists());
    assert_eq!(executor.asset_generations.load(Ordering::SeqCst), 1);

    // Subsequent calls trust the cached bootstrap.
    manager.ensure().await.unwrap();
    assert_eq!(executor.asset_generations.load(Ordering::SeqCst), 1);
}
