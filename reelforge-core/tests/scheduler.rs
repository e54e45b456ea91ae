use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;

use reelforge_core::{
    load_pipeline_config, BroadcastChannel, JobRecordStore, JobRunner, JobScheduler, JobStatus,
    PipelineConfig, PipelineError, PipelineOutputs, PipelineResult, SchedulerError,
    SqliteJobStore, StatusPublisher, TranscodeError, TranscodeJob,
};

fn fixture_config(base: &TempDir) -> PipelineConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml");
    let mut config = load_pipeline_config(path).expect("fixture config should parse");
    config.paths.base_dir = base.path().to_string_lossy().to_string();
    config
}

struct Harness {
    scheduler: JobScheduler,
    store: Arc<dyn JobRecordStore>,
    _base: TempDir,
}

fn harness(runner: Arc<dyn JobRunner>, adjust: impl FnOnce(&mut PipelineConfig)) -> Harness {
    let base = TempDir::new().unwrap();
    let mut config = fixture_config(&base);
    adjust(&mut config);
    let config = Arc::new(config);
    let store = SqliteJobStore::builder()
        .path(base.path().join("jobs.sqlite"))
        .build()
        .unwrap();
    store.initialize().unwrap();
    let store: Arc<dyn JobRecordStore> = Arc::new(store);
    let publisher = Arc::new(StatusPublisher::new(
        store.clone(),
        Arc::new(BroadcastChannel::default()),
    ));
    let scheduler = JobScheduler::new(runner, store.clone(), publisher, config).unwrap();
    Harness {
        scheduler,
        store,
        _base: base,
    }
}

fn outputs() -> PipelineOutputs {
    PipelineOutputs {
        manifest_path: PathBuf::from("/streams/job/master.m3u8"),
        thumbnail_path: PathBuf::from("/streams/job/poster.png"),
        duration_seconds: 10.0,
        width: 1920,
        height: 1080,
    }
}

fn scripted_failure() -> PipelineError {
    PipelineError::Transcode(TranscodeError::Failed {
        status: Some(1),
        stderr: "scripted failure".into(),
    })
}

#[derive(Default)]
struct CountingRunner {
    active: AtomicUsize,
    max_active: AtomicUsize,
    hold: Option<Duration>,
    fail: bool,
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl JobRunner for CountingRunner {
    async fn run(&self, _job: &TranscodeJob) -> PipelineResult<PipelineOutputs> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(Instant::now());
        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(scripted_failure())
        } else {
            Ok(outputs())
        }
    }
}

async fn wait_until_idle(scheduler: &JobScheduler) {
    while !scheduler.is_idle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_bound_is_respected() {
    let runner = Arc::new(CountingRunner {
        hold: Some(Duration::from_millis(200)),
        ..CountingRunner::default()
    });
    let harness = harness(runner.clone(), |_| {});

    for index in 0..6 {
        harness
            .scheduler
            .submit(TranscodeJob::new(
                format!("job-{index}"),
                "/tmp/in.mp4",
                "alice",
            ))
            .unwrap();
    }
    wait_until_idle(&harness.scheduler).await;

    assert_eq!(runner.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(runner.attempts.lock().unwrap().len(), 6);
    for index in 0..6 {
        let record = harness
            .store
            .fetch(&format!("job-{index}"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Ready);
    }
}

#[tokio::test(start_paused = true)]
async fn slots_are_released_when_every_job_fails() {
    let runner = Arc::new(CountingRunner {
        fail: true,
        ..CountingRunner::default()
    });
    let harness = harness(runner.clone(), |config| {
        config.retry.base_delay_seconds = 1;
    });

    for index in 0..5 {
        harness
            .scheduler
            .submit(TranscodeJob::new(
                format!("job-{index}"),
                "/tmp/in.mp4",
                "alice",
            ))
            .unwrap();
    }
    wait_until_idle(&harness.scheduler).await;

    assert_eq!(harness.scheduler.active(), 0);
    assert_eq!(harness.scheduler.pending(), 0);
    assert!(runner.max_active.load(Ordering::SeqCst) <= 2);
    for index in 0..5 {
        let record = harness
            .store
            .fetch(&format!("job-{index}"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }
}

#[tokio::test(start_paused = true)]
async fn retries_are_exhausted_with_increasing_backoff() {
    let runner = Arc::new(CountingRunner {
        fail: true,
        ..CountingRunner::default()
    });
    let harness = harness(runner.clone(), |config| {
        config.retry.base_delay_seconds = 5;
        config.retry.max_delay_seconds = 60;
    });

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"))
        .unwrap();
    wait_until_idle(&harness.scheduler).await;

    let attempts = runner.attempts.lock().unwrap();
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_secs(5));
    assert!(second_gap > first_gap);

    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.stage, "failed");
    assert!(record
        .error
        .as_deref()
        .unwrap()
        .contains("transcoder exited with status 1"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_is_rejected_while_live() {
    let runner = Arc::new(CountingRunner {
        hold: Some(Duration::from_secs(5)),
        ..CountingRunner::default()
    });
    let harness = harness(runner, |_| {});

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"))
        .unwrap();
    let duplicate = harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"));
    assert!(matches!(
        duplicate,
        Err(SchedulerError::Duplicate { .. })
    ));

    wait_until_idle(&harness.scheduler).await;
    // Once the first run reached a terminal state the id may be reused.
    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"))
        .unwrap();
    wait_until_idle(&harness.scheduler).await;
}

#[tokio::test(start_paused = true)]
async fn successful_job_lands_ready_with_outputs() {
    let runner = Arc::new(CountingRunner::default());
    let harness = harness(runner, |_| {});

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"))
        .unwrap();
    wait_until_idle(&harness.scheduler).await;

    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Ready);
    assert_eq!(record.progress_percent, 100);
    assert_eq!(record.retry_count, 0);
    assert_eq!(
        record.manifest_path.as_deref(),
        Some("/streams/job/master.m3u8")
    );
    assert_eq!(
        record.thumbnail_path.as_deref(),
        Some("/streams/job/poster.png")
    );
}

#[tokio::test(start_paused = true)]
async fn stuck_attempts_hit_the_wall_clock_ceiling() {
    let runner = Arc::new(CountingRunner {
        hold: Some(Duration::from_secs(10 * 60)),
        ..CountingRunner::default()
    });
    let harness = harness(runner.clone(), |config| {
        config.limits.job_timeout_minutes = 1;
        config.retry.max_attempts = 2;
        config.retry.base_delay_seconds = 1;
    });

    harness
        .scheduler
        .submit(TranscodeJob::new("abc123", "/tmp/in.mp4", "alice"))
        .unwrap();
    wait_until_idle(&harness.scheduler).await;

    assert_eq!(runner.attempts.lock().unwrap().len(), 2);
    let record = harness.store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("minute limit"));
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_purges_outputs_and_input_per_policy() {
    struct LitteringRunner {
        output_dir: PathBuf,
    }

    #[async_trait]
    impl JobRunner for LitteringRunner {
        async fn run(&self, _job: &TranscodeJob) -> PipelineResult<PipelineOutputs> {
            std::fs::create_dir_all(&self.output_dir).unwrap();
            std::fs::write(self.output_dir.join("1080p_00001.ts"), b"partial").unwrap();
            Err(scripted_failure())
        }
    }

    let base = TempDir::new().unwrap();
    let input_path = base.path().join("raw.mp4");
    std::fs::write(&input_path, b"raw upload").unwrap();
    let output_dir = base.path().join("streams").join("abc123");

    let runner = Arc::new(LitteringRunner {
        output_dir: output_dir.clone(),
    });
    let mut config = fixture_config(&base);
    config.retry.max_attempts = 1;
    config.cleanup.remove_input_on_failure = true;
    let config = Arc::new(config);
    let store = SqliteJobStore::builder()
        .path(base.path().join("jobs.sqlite"))
        .build()
        .unwrap();
    store.initialize().unwrap();
    let store: Arc<dyn JobRecordStore> = Arc::new(store);
    let publisher = Arc::new(StatusPublisher::new(
        store.clone(),
        Arc::new(BroadcastChannel::default()),
    ));
    let scheduler = JobScheduler::new(runner, store.clone(), publisher, config).unwrap();

    scheduler
        .submit(TranscodeJob::new("abc123", &input_path, "alice"))
        .unwrap();
    while !scheduler.is_idle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!output_dir.exists());
    assert!(!input_path.exists());
    let record = store.fetch("abc123").unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);

    // Full failure detail is appended to the server-side log.
    let log = std::fs::read_to_string(base.path().join("logs").join("pipeline_failures.log"))
        .unwrap();
    assert!(log.contains("abc123"));
}
