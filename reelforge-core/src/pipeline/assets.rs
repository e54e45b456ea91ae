use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::PipelineConfig;

use super::escape_drawtext;
use super::exec::{stderr_excerpt, CommandExecutor};

const PLACEHOLDER_CANVAS: &str = "240x96";
const PLACEHOLDER_BACKGROUND: &str = "0x202020";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("placeholder generation exited with status {status:?}: {stderr}")]
    Generation {
        status: Option<i32>,
        stderr: String,
    },
}

pub type AssetResult<T> = Result<T, AssetError>;

/// Paths to the watermark inputs used by the transcode filter graph. The
/// font is optional: drawtext falls back to a system font when it is absent.
#[derive(Debug, Clone)]
pub struct WatermarkAssets {
    pub logo_path: PathBuf,
    pub font_path: Option<PathBuf>,
}

/// Guarantees the watermark inputs exist on disk, synthesising a placeholder
/// logo on first miss. The bootstrap runs at most once per process;
/// afterwards `ensure` is a cached clone.
pub struct WatermarkAssetManager {
    config: Arc<PipelineConfig>,
    executor: Arc<dyn CommandExecutor>,
    bootstrap: OnceCell<WatermarkAssets>,
}

impl WatermarkAssetManager {
    pub fn new(config: Arc<PipelineConfig>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            config,
            executor,
            bootstrap: OnceCell::new(),
        }
    }

    pub async fn ensure(&self) -> AssetResult<WatermarkAssets> {
        self.bootstrap
            .get_or_try_init(|| self.bootstrap_assets())
            .await
            .cloned()
    }

    async fn bootstrap_assets(&self) -> AssetResult<WatermarkAssets> {
        let logo_path = self.config.resolve_path(&self.config.watermark.logo_file);
        let fonts_dir = self.config.resolve_path(&self.config.paths.fonts_dir);
        tokio::fs::create_dir_all(&fonts_dir)
            .await
            .map_err(|source| AssetError::Io {
                source,
                path: fonts_dir.clone(),
            })?;

        if !logo_path.exists() {
            info!(path = %logo_path.display(), "watermark logo missing, generating placeholder");
            self.generate_placeholder(&logo_path).await?;
        } else {
            debug!(path = %logo_path.display(), "watermark logo present");
        }

        let font_path = self.config.resolve_path(&self.config.watermark.font_file);
        let font_path = font_path.exists().then_some(font_path);
        if font_path.is_none() {
            debug!("watermark font missing, drawtext will use the system font");
        }

        Ok(WatermarkAssets {
            logo_path,
            font_path,
        })
    }

    async fn generate_placeholder(&self, logo_path: &std::path::Path) -> AssetResult<()> {
        if let Some(parent) = logo_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AssetError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let label = escape_drawtext(&self.config.watermark.placeholder_label);
        let filter = format!(
            "drawtext=text='{label}':fontcolor=white:fontsize={size}:x=(w-text_w)/2:y=(h-text_h)/2",
            size = self.config.watermark.font_size
        );
        let args = vec![
            "-y".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=c={PLACEHOLDER_BACKGROUND}:s={PLACEHOLDER_CANVAS}"),
            "-vf".to_string(),
            filter,
            "-frames:v".to_string(),
            "1".to_string(),
            logo_path.to_string_lossy().to_string(),
        ];
        let mut command = Command::new(&self.config.ffmpeg.ffmpeg_binary);
        for arg in &args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(AssetError::Spawn)?;
        if !output.status.success() {
            return Err(AssetError::Generation {
                status: output.status.code(),
                stderr: stderr_excerpt(&output.stderr),
            });
        }
        Ok(())
    }
}
