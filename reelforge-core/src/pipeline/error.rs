use std::path::PathBuf;

use thiserror::Error;

use super::assets::AssetError;
use super::probe::ProbeError;
use super::thumbnail::ThumbnailError;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("ffmpeg exited with status {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("metadata probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("thumbnail generation failed: {0}")]
    Thumbnail(#[from] ThumbnailError),
    #[error("transcode failed: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("watermark assets unavailable: {0}")]
    Asset(#[from] AssetError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Failure text fit for the job record and the owning client: one line,
    /// no host paths, no transcoder log dumps. Full detail stays in the
    /// server-side logs.
    pub fn summary(&self) -> String {
        match self {
            PipelineError::Probe(ProbeError::NoVideoStream { .. }) => {
                "no video stream found in the uploaded file".into()
            }
            PipelineError::Probe(_) => "could not read metadata from the uploaded file".into(),
            PipelineError::Thumbnail(_) => "poster frame extraction failed".into(),
            PipelineError::Transcode(TranscodeError::Failed { status, .. }) => match status {
                Some(code) => format!("transcoder exited with status {code}"),
                None => "transcoder was terminated by a signal".into(),
            },
            PipelineError::Transcode(TranscodeError::Spawn(_)) => {
                "transcoder could not be started".into()
            }
            PipelineError::Asset(_) => "watermark assets could not be prepared".into(),
            PipelineError::Io { .. } => "storage error while writing outputs".into(),
            PipelineError::Serialization(_) => "internal serialization error".into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
