mod assets;
mod error;
mod exec;
mod probe;
mod thumbnail;
mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{LadderTier, PipelineConfig};
use crate::publish::StatusPublisher;

pub use assets::{AssetError, AssetResult, WatermarkAssetManager, WatermarkAssets};
pub use error::{PipelineError, PipelineResult, TranscodeError};
pub use exec::{command_line, stderr_excerpt, CommandExecutor, SystemCommandExecutor};
pub use probe::{MediaProbe, ProbeError, ProbeResult};
pub use thumbnail::{ThumbnailError, ThumbnailResult, ThumbnailSampler};
pub use types::{
    stages, MediaMetadata, PipelineOutputs, ProgressTracker, ProgressUpdate, RetryPolicy,
    TranscodeJob,
};

pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";
pub const POSTER_FILE_NAME: &str = "poster.png";
pub const CHECKSUMS_FILE_NAME: &str = "checksums.json";

/// Drives one job attempt end to end: probe, watermark check, concurrent
/// thumbnail and multi-tier transcode, then finalisation. Retries are the
/// scheduler's concern; an attempt either completes or surfaces its error.
pub struct TranscodeOrchestrator {
    config: Arc<PipelineConfig>,
    executor: Arc<dyn CommandExecutor>,
    publisher: Arc<StatusPublisher>,
    probe: MediaProbe,
    sampler: ThumbnailSampler,
    assets: Arc<WatermarkAssetManager>,
}

impl TranscodeOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        executor: Arc<dyn CommandExecutor>,
        publisher: Arc<StatusPublisher>,
    ) -> Self {
        let probe = MediaProbe::new(executor.clone(), &config.ffmpeg.ffprobe_binary);
        let sampler = ThumbnailSampler::new(
            executor.clone(),
            &config.ffmpeg.ffmpeg_binary,
            config.thumbnail.clone(),
        );
        let assets = Arc::new(WatermarkAssetManager::new(config.clone(), executor.clone()));
        Self {
            config,
            executor,
            publisher,
            probe,
            sampler,
            assets,
        }
    }

    pub fn output_directory(&self, job_id: &str) -> PathBuf {
        self.config
            .resolve_path(&self.config.paths.storage_dir)
            .join(job_id)
    }

    pub fn asset_manager(&self) -> Arc<WatermarkAssetManager> {
        self.assets.clone()
    }

    pub async fn run(&self, job: &TranscodeJob) -> PipelineResult<PipelineOutputs> {
        let started = Instant::now();
        self.publisher
            .publish_progress(&job.job_id, 0, stages::METADATA, None);
        let metadata = self.probe.probe(&job.input_path).await?;
        info!(
            job_id = %job.job_id,
            resolution = %metadata.resolution(),
            duration = metadata.duration_seconds,
            fps = metadata.fps,
            "input probed"
        );
        self.publisher.publish_progress(
            &job.job_id,
            0,
            stages::METADATA,
            Some(json!({
                "duration_seconds": metadata.duration_seconds,
                "resolution": metadata.resolution(),
            })),
        );

        let watermark = match self.assets.ensure().await {
            Ok(assets) => Some(assets),
            Err(error) => {
                warn!(job_id = %job.job_id, %error, "watermark assets unavailable, encoding without overlay");
                None
            }
        };

        let output_dir = self.output_directory(&job.job_id);
        self.prepare_output_dir(&output_dir).await?;

        // Written before the transcode starts so adaptive clients can pick
        // up any variant as soon as it completes.
        let master_path = output_dir.join(MASTER_PLAYLIST_NAME);
        let master = render_master_playlist(&self.config.ladder, &metadata);
        tokio::fs::write(&master_path, master)
            .await
            .map_err(|source| PipelineError::Io {
                source,
                path: master_path.clone(),
            })?;

        let thumbnail_path = output_dir.join(POSTER_FILE_NAME);
        let (transcode, thumbnail) = tokio::join!(
            self.run_transcode(job, &metadata, &output_dir, watermark.as_ref(), started),
            self.sampler
                .sample(&job.input_path, &thumbnail_path, metadata.duration_seconds)
        );
        transcode?;
        let thumbnail_path = thumbnail?;

        self.publisher
            .publish_progress(&job.job_id, 100, stages::CLEANUP, None);
        self.write_checksums(&output_dir).await?;
        info!(job_id = %job.job_id, manifest = %master_path.display(), "transcode complete");

        Ok(PipelineOutputs {
            manifest_path: master_path,
            thumbnail_path,
            duration_seconds: metadata.duration_seconds,
            width: metadata.width,
            height: metadata.height,
        })
    }

    async fn run_transcode(
        &self,
        job: &TranscodeJob,
        metadata: &MediaMetadata,
        output_dir: &Path,
        watermark: Option<&WatermarkAssets>,
        started: Instant,
    ) -> PipelineResult<()> {
        let args = build_transcode_args(
            &self.config,
            &job.input_path,
            output_dir,
            metadata,
            &job.owner_display_name,
            watermark,
        );
        let program = Path::new(&self.config.ffmpeg.ffmpeg_binary);
        debug!(job_id = %job.job_id, command = %command_line(program, &args), "starting transcode");

        let mut command = Command::new(program);
        for arg in &args {
            command.arg(arg);
        }
        let (lines_tx, mut lines_rx) = mpsc::channel::<String>(64);
        let relay = async {
            let mut tracker = ProgressTracker::new(metadata.duration_seconds, started);
            while let Some(line) = lines_rx.recv().await {
                if let Some(update) = tracker.observe(&line) {
                    let extra = update
                        .eta_seconds
                        .map(|eta| json!({ "eta_seconds": eta }));
                    self.publisher.publish_progress(
                        &job.job_id,
                        update.percent,
                        stages::TRANSCODING,
                        extra,
                    );
                }
            }
        };
        let (output, ()) = tokio::join!(self.executor.run_streaming(&mut command, lines_tx), relay);
        let output = output.map_err(TranscodeError::Spawn)?;
        if !output.status.success() {
            let stderr = stderr_excerpt(&output.stderr);
            error!(
                job_id = %job.job_id,
                status = ?output.status.code(),
                stderr = %stderr,
                "transcode process failed"
            );
            return Err(TranscodeError::Failed {
                status: output.status.code(),
                stderr,
            }
            .into());
        }
        Ok(())
    }

    /// Each attempt starts from an empty output directory so segments from a
    /// previous attempt never mix with fresh ones.
    async fn prepare_output_dir(&self, output_dir: &Path) -> PipelineResult<()> {
        if output_dir.exists() {
            tokio::fs::remove_dir_all(output_dir)
                .await
                .map_err(|source| PipelineError::Io {
                    source,
                    path: output_dir.to_path_buf(),
                })?;
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| PipelineError::Io {
                source,
                path: output_dir.to_path_buf(),
            })?;
        Ok(())
    }

    async fn write_checksums(&self, output_dir: &Path) -> PipelineResult<()> {
        use sha2::{Digest, Sha256};

        let mut checksums = BTreeMap::new();
        for entry in walkdir::WalkDir::new(output_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.path();
            if path.file_name().is_some_and(|name| name == CHECKSUMS_FILE_NAME) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(output_dir) else {
                continue;
            };
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| PipelineError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            checksums.insert(
                relative.to_string_lossy().to_string(),
                hex::encode(hasher.finalize()),
            );
        }
        let payload = serde_json::to_vec_pretty(&checksums)?;
        let checksums_path = output_dir.join(CHECKSUMS_FILE_NAME);
        tokio::fs::write(&checksums_path, payload)
            .await
            .map_err(|source| PipelineError::Io {
                source,
                path: checksums_path,
            })?;
        Ok(())
    }
}

/// Master playlist listing every ladder tier, bandwidth derived from the
/// configured bitrate and resolution scaled to the input aspect ratio.
pub fn render_master_playlist(ladder: &[LadderTier], metadata: &MediaMetadata) -> String {
    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");
    for tier in ladder {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME=\"{}\"\n",
            tier.bandwidth(),
            metadata.scaled_width(tier.height),
            tier.height,
            tier.name
        ));
        playlist.push_str(&format!("{}.m3u8\n", tier.name));
    }
    playlist
}

/// Escapes text destined for a drawtext filter argument.
pub(crate) fn escape_drawtext(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            ':' => escaped.push_str("\\:"),
            '%' => escaped.push_str("\\%"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Filter graph splitting the decoded stream into one scaled branch per
/// tier. The first (highest) tier alone is composed through the watermark:
/// logo overlay at a fixed top-left offset, then the owner handle drawn
/// mid-right with a drop shadow. Returns the graph and the label of the
/// first tier's final output.
fn build_filter_graph(
    config: &PipelineConfig,
    owner: &str,
    watermark: Option<&WatermarkAssets>,
) -> (String, String) {
    let tiers = &config.ladder;
    let mut chains = Vec::new();
    let split_labels: String = (0..tiers.len()).map(|i| format!("[v{i}]")).collect();
    chains.push(format!("[0:v]split={}{}", tiers.len(), split_labels));
    for (index, tier) in tiers.iter().enumerate() {
        chains.push(format!("[v{index}]scale=-2:{}[s{index}]", tier.height));
    }
    let first_label = match watermark {
        Some(assets) => {
            let section = &config.watermark;
            chains.push(format!(
                "[s0][1:v]overlay={}:{}[wm0]",
                section.logo_offset_x, section.logo_offset_y
            ));
            let fontfile = assets
                .font_path
                .as_ref()
                .map(|path| format!("fontfile='{}':", path.display()))
                .unwrap_or_default();
            chains.push(format!(
                "[wm0]drawtext={fontfile}text='@{}':fontsize={}:fontcolor=white:\
                 shadowcolor=black@0.6:shadowx=2:shadowy=2:x=w-text_w-{}:y=(h-text_h)/2[b0]",
                escape_drawtext(owner),
                section.font_size,
                section.text_offset_right
            ));
            "b0".to_string()
        }
        None => "s0".to_string(),
    };
    (chains.join(";"), first_label)
}

/// One transcoder invocation covering every tier, sharing the decode cost.
fn build_transcode_args(
    config: &PipelineConfig,
    input: &Path,
    output_dir: &Path,
    metadata: &MediaMetadata,
    owner: &str,
    watermark: Option<&WatermarkAssets>,
) -> Vec<String> {
    let (graph, first_label) = build_filter_graph(config, owner, watermark);
    let segmenting = &config.segmenting;
    let mut args = vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-loglevel".to_string(),
        config.ffmpeg.log_level.clone(),
        "-nostats".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];
    if let Some(assets) = watermark {
        args.push("-i".to_string());
        args.push(assets.logo_path.to_string_lossy().to_string());
    }
    args.push("-filter_complex".to_string());
    args.push(graph);

    for (index, _) in config.ladder.iter().enumerate() {
        let label = if index == 0 {
            first_label.clone()
        } else {
            format!("s{index}")
        };
        args.push("-map".to_string());
        args.push(format!("[{label}]"));
        if metadata.has_audio {
            args.push("-map".to_string());
            args.push("0:a:0".to_string());
        }
    }

    for (index, tier) in config.ladder.iter().enumerate() {
        args.push(format!("-c:v:{index}"));
        args.push("libx264".to_string());
        args.push(format!("-preset:v:{index}"));
        args.push(tier.preset.clone());
        args.push(format!("-crf:v:{index}"));
        args.push(tier.crf.to_string());
        args.push(format!("-maxrate:v:{index}"));
        args.push(format!("{}k", tier.bitrate_kbps));
        args.push(format!("-bufsize:v:{index}"));
        args.push(format!("{}k", tier.bitrate_kbps * 2));
    }
    if metadata.has_audio {
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        for (index, tier) in config.ladder.iter().enumerate() {
            args.push(format!("-b:a:{index}"));
            args.push(tier.audio_bitrate.clone());
        }
    }

    args.push("-pix_fmt".to_string());
    args.push("yuv420p".to_string());
    args.push("-g".to_string());
    args.push(segmenting.keyframe_interval.to_string());
    args.push("-keyint_min".to_string());
    args.push(segmenting.keyframe_interval.to_string());
    args.push("-sc_threshold".to_string());
    args.push("0".to_string());
    args.push("-force_key_frames".to_string());
    args.push(format!(
        "expr:gte(t,n_forced*{})",
        segmenting.segment_seconds
    ));

    args.push("-f".to_string());
    args.push("hls".to_string());
    args.push("-hls_time".to_string());
    args.push(segmenting.segment_seconds.to_string());
    args.push("-hls_playlist_type".to_string());
    args.push("vod".to_string());
    args.push("-hls_segment_type".to_string());
    args.push("mpegts".to_string());
    args.push("-hls_list_size".to_string());
    args.push("0".to_string());
    args.push("-hls_segment_filename".to_string());
    args.push(
        output_dir
            .join("%v_%05d.ts")
            .to_string_lossy()
            .to_string(),
    );

    let var_stream_map = config
        .ladder
        .iter()
        .enumerate()
        .map(|(index, tier)| {
            if metadata.has_audio {
                format!("v:{index},a:{index},name:{}", tier.name)
            } else {
                format!("v:{index},name:{}", tier.name)
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    args.push("-var_stream_map".to_string());
    args.push(var_stream_map);
    args.push(output_dir.join("%v.m3u8").to_string_lossy().to_string());
    args
}
