use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;

use super::exec::{stderr_excerpt, CommandExecutor};
use super::types::MediaMetadata;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to spawn ffprobe: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("ffprobe exited with status {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("unreadable probe report: {0}")]
    Report(String),
    #[error("no video stream present in {path}")]
    NoVideoStream { path: PathBuf },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Extracts duration, resolution, and frame rate from a raw input file via a
/// structured ffprobe report. Read-only; retry policy belongs to the
/// scheduler.
pub struct MediaProbe {
    executor: Arc<dyn CommandExecutor>,
    ffprobe: PathBuf,
}

impl MediaProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            ffprobe: ffprobe.into(),
        }
    }

    pub async fn probe(&self, input: &Path) -> ProbeResult<MediaMetadata> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            input.to_string_lossy().to_string(),
        ];
        let mut command = Command::new(&self.ffprobe);
        for arg in &args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(ProbeError::Spawn)?;
        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status.code(),
                stderr: stderr_excerpt(&output.stderr),
            });
        }
        parse_report(&output.stdout, input)
    }
}

fn parse_report(stdout: &[u8], input: &Path) -> ProbeResult<MediaMetadata> {
    let report: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|err| ProbeError::Report(err.to_string()))?;
    let streams = report["streams"]
        .as_array()
        .ok_or_else(|| ProbeError::Report("missing streams array".into()))?;
    let video = streams
        .iter()
        .find(|stream| stream["codec_type"] == "video")
        .ok_or_else(|| ProbeError::NoVideoStream {
            path: input.to_path_buf(),
        })?;

    let width = video["width"]
        .as_u64()
        .ok_or_else(|| ProbeError::Report("video stream missing width".into()))? as u32;
    let height = video["height"]
        .as_u64()
        .ok_or_else(|| ProbeError::Report("video stream missing height".into()))? as u32;
    if width == 0 || height == 0 {
        return Err(ProbeError::Report("video stream has zero dimensions".into()));
    }

    let duration_seconds = report["format"]["duration"]
        .as_str()
        .and_then(|value| value.parse::<f64>().ok())
        .or_else(|| {
            video["duration"]
                .as_str()
                .and_then(|value| value.parse::<f64>().ok())
        })
        .ok_or_else(|| ProbeError::Report("report missing duration".into()))?;
    if duration_seconds <= 0.0 {
        return Err(ProbeError::Report("report has non-positive duration".into()));
    }

    let fps = video["r_frame_rate"]
        .as_str()
        .and_then(parse_rational)
        .or_else(|| video["avg_frame_rate"].as_str().and_then(parse_rational))
        .ok_or_else(|| ProbeError::Report("video stream missing frame rate".into()))?;

    let has_audio = streams
        .iter()
        .any(|stream| stream["codec_type"] == "audio");

    Ok(MediaMetadata {
        duration_seconds,
        width,
        height,
        fps,
        has_audio,
    })
}

fn parse_rational(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator: f64 = numerator.parse().ok()?;
            let denominator: f64 = denominator.parse().ok()?;
            if denominator == 0.0 {
                return None;
            }
            Some(numerator / denominator)
        }
        None => value.parse().ok(),
    }
}
