use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::{ThumbnailSection, ThumbnailStrategy};

use super::exec::{stderr_excerpt, CommandExecutor};

/// Earliest sample point, avoiding timestamp 0 edge cases on short clips.
const MIN_OFFSET_SECONDS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("candidate extraction at {timestamp:.1}s exited with status {status:?}: {stderr}")]
    Extraction {
        timestamp: f64,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("could not score candidate {path}: {reason}")]
    Score { path: PathBuf, reason: String },
    #[error("no candidates produced")]
    Empty,
}

pub type ThumbnailResult<T> = Result<T, ThumbnailError>;

/// Extracts several candidate frames spread across the clip and promotes one
/// to the poster image. Scratch frames live in a temporary directory whose
/// removal is guaranteed by drop, on success and on failure.
pub struct ThumbnailSampler {
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: PathBuf,
    section: ThumbnailSection,
}

impl ThumbnailSampler {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        ffmpeg: impl Into<PathBuf>,
        section: ThumbnailSection,
    ) -> Self {
        Self {
            executor,
            ffmpeg: ffmpeg.into(),
            section,
        }
    }

    pub async fn sample(
        &self,
        input: &Path,
        output: &Path,
        duration_seconds: f64,
    ) -> ThumbnailResult<PathBuf> {
        let scratch = tempfile::tempdir().map_err(|source| ThumbnailError::Io {
            source,
            path: std::env::temp_dir(),
        })?;
        let offsets = candidate_offsets(duration_seconds, self.section.candidates);
        let mut candidates = Vec::with_capacity(offsets.len());
        for (index, timestamp) in offsets.iter().enumerate() {
            let candidate = scratch.path().join(format!("candidate_{index:02}.png"));
            self.extract_frame(input, &candidate, *timestamp).await?;
            candidates.push(candidate);
        }
        if candidates.is_empty() {
            return Err(ThumbnailError::Empty);
        }

        let winner = match self.section.strategy {
            ThumbnailStrategy::Middle => candidates.len() / 2,
            ThumbnailStrategy::Brightest => brightest_index(&candidates)?,
        };
        debug!(
            winner,
            strategy = ?self.section.strategy,
            "selected poster candidate"
        );

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ThumbnailError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        tokio::fs::copy(&candidates[winner], output)
            .await
            .map_err(|source| ThumbnailError::Io {
                source,
                path: output.to_path_buf(),
            })?;
        Ok(output.to_path_buf())
    }

    async fn extract_frame(
        &self,
        input: &Path,
        output: &Path,
        timestamp: f64,
    ) -> ThumbnailResult<()> {
        let scale = format!(
            "scale={}:{}:force_original_aspect_ratio=decrease",
            self.section.width, self.section.height
        );
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{timestamp:.3}"),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            scale,
            output.to_string_lossy().to_string(),
        ];
        let mut command = Command::new(&self.ffmpeg);
        for arg in &args {
            command.arg(arg);
        }
        let result = self
            .executor
            .run(&mut command)
            .await
            .map_err(ThumbnailError::Spawn)?;
        if !result.status.success() {
            return Err(ThumbnailError::Extraction {
                timestamp,
                status: result.status.code(),
                stderr: stderr_excerpt(&result.stderr),
            });
        }
        Ok(())
    }
}

/// Sample points spread evenly across the clip: for five candidates this is
/// 10%, 30%, 50%, 70%, and 90% of the duration, floored at one second.
fn candidate_offsets(duration_seconds: f64, count: u32) -> Vec<f64> {
    (0..count)
        .map(|index| {
            let fraction = (2 * index + 1) as f64 / (2 * count) as f64;
            (duration_seconds * fraction).max(MIN_OFFSET_SECONDS)
        })
        .collect()
}

fn brightest_index(candidates: &[PathBuf]) -> ThumbnailResult<usize> {
    let mut best = 0usize;
    let mut best_luma = -1.0f64;
    for (index, path) in candidates.iter().enumerate() {
        let luma = mean_luma(path)?;
        if luma > best_luma {
            best_luma = luma;
            best = index;
        }
    }
    Ok(best)
}

fn mean_luma(path: &Path) -> ThumbnailResult<f64> {
    let decoded = image::open(path).map_err(|err| ThumbnailError::Score {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let gray = decoded.to_luma8();
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return Err(ThumbnailError::Score {
            path: path.to_path_buf(),
            reason: "empty image".into(),
        });
    }
    let total: u64 = pixels.iter().map(|value| *value as u64).sum();
    Ok(total as f64 / pixels.len() as f64)
}
