use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub retry: RetrySection,
    pub segmenting: SegmentingSection,
    pub watermark: WatermarkSection,
    pub thumbnail: ThumbnailSection,
    pub cleanup: CleanupSection,
    pub ffmpeg: FfmpegSection,
    pub ladder: Vec<LadderTier>,
}

impl PipelineConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ladder.is_empty() {
            return Err(ConfigError::Invalid(
                "quality ladder must contain at least one tier".into(),
            ));
        }
        for pair in self.ladder.windows(2) {
            if pair[1].height >= pair[0].height {
                return Err(ConfigError::Invalid(
                    "quality ladder must be ordered highest tier first".into(),
                ));
            }
        }
        if self.limits.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_concurrent_jobs must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.segmenting.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "segmenting.segment_seconds must be greater than zero".into(),
            ));
        }
        if self.thumbnail.candidates == 0 {
            return Err(ConfigError::Invalid(
                "thumbnail.candidates must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub ingest_dir: String,
    pub storage_dir: String,
    pub fonts_dir: String,
    pub logs_dir: String,
    pub jobs_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_jobs: u32,
    pub job_timeout_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentingSection {
    pub segment_seconds: u32,
    pub keyframe_interval: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatermarkSection {
    pub logo_file: String,
    pub font_file: String,
    pub logo_offset_x: u32,
    pub logo_offset_y: u32,
    pub text_offset_right: u32,
    pub font_size: u32,
    pub placeholder_label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailSection {
    pub width: u32,
    pub height: u32,
    pub candidates: u32,
    pub strategy: ThumbnailStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailStrategy {
    Middle,
    Brightest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSection {
    pub purge_outputs_on_failure: bool,
    pub remove_input_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSection {
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LadderTier {
    pub name: String,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
}

impl LadderTier {
    /// Bandwidth advertised in the master playlist, bits per second.
    pub fn bandwidth(&self) -> u64 {
        self.bitrate_kbps as u64 * 1000 + parse_bitrate(&self.audio_bitrate).unwrap_or(0)
    }
}

pub fn parse_bitrate(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Some(kilobits) = trimmed.strip_suffix(['k', 'K']) {
        return kilobits.parse::<u64>().ok().map(|v| v * 1000);
    }
    if let Some(megabits) = trimmed.strip_suffix(['M', 'm']) {
        return megabits.parse::<u64>().ok().map(|v| v * 1_000_000);
    }
    trimmed.parse().ok()
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let config: PipelineConfig =
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
    config.validate()?;
    Ok(config)
}
