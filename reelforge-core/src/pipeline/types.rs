use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::config::RetrySection;
use crate::error::ConfigError;

/// Stage labels persisted on the job record. Informational only; control
/// decisions never branch on them.
pub mod stages {
    pub const INITIALIZING: &str = "initializing";
    pub const METADATA: &str = "metadata";
    pub const TRANSCODING: &str = "transcoding";
    pub const CLEANUP: &str = "cleanup";
    pub const READY: &str = "ready";
    pub const FAILED: &str = "failed";
}

/// One submitted unit of transcoding work. The id doubles as the owning
/// video record's identifier and stays stable for the job's lifetime.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub job_id: String,
    pub input_path: PathBuf,
    pub owner_display_name: String,
}

impl TranscodeJob {
    pub fn new(
        job_id: impl Into<String>,
        input_path: impl Into<PathBuf>,
        owner_display_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            input_path: input_path.into(),
            owner_display_name: owner_display_name.into(),
        }
    }

    pub fn with_generated_id(
        input_path: impl Into<PathBuf>,
        owner_display_name: impl Into<String>,
    ) -> Self {
        Self::new(Uuid::new_v4().to_string(), input_path, owner_display_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaMetadata {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
}

impl MediaMetadata {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Width of a scaled rendition at `height`, preserving aspect and
    /// rounded to an even value as the encoder requires.
    pub fn scaled_width(&self, height: u32) -> u32 {
        let width = (self.width as f64 / self.height as f64 * height as f64).round() as u32;
        width + width % 2
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutputs {
    pub manifest_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based): the base delay
    /// doubled per consumed attempt, capped.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }
}

impl TryFrom<&RetrySection> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(section: &RetrySection) -> Result<Self, Self::Error> {
        if section.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        Ok(Self {
            max_attempts: section.max_attempts,
            base_delay: Duration::from_secs(section.base_delay_seconds),
            max_delay: Duration::from_secs(section.max_delay_seconds),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub eta_seconds: Option<u64>,
}

/// Folds the transcoder's `-progress` key=value stream into monotonically
/// non-decreasing percent updates for the reference stream.
pub struct ProgressTracker {
    duration_seconds: f64,
    started: Instant,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new(duration_seconds: f64, started: Instant) -> Self {
        Self {
            duration_seconds,
            started,
            last_percent: None,
        }
    }

    /// Returns an update only when the reported position advances the
    /// percentage.
    pub fn observe(&mut self, line: &str) -> Option<ProgressUpdate> {
        let percent = self.percent_for(line.trim())?;
        if self.last_percent.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(ProgressUpdate {
            percent,
            eta_seconds: self.estimate_eta(percent),
        })
    }

    fn percent_for(&self, line: &str) -> Option<u8> {
        let (key, value) = line.split_once('=')?;
        let seconds = match key {
            "out_time_us" | "out_time_ms" => {
                let micros: f64 = value.trim().parse().ok()?;
                micros / 1_000_000.0
            }
            "out_time" => parse_clock(value.trim())?,
            "progress" => {
                if value.trim() == "end" {
                    return Some(100);
                }
                return None;
            }
            _ => return None,
        };
        if self.duration_seconds <= 0.0 {
            return None;
        }
        let percent = (seconds / self.duration_seconds * 100.0).clamp(0.0, 100.0);
        Some(percent.floor() as u8)
    }

    fn estimate_eta(&self, percent: u8) -> Option<u64> {
        if percent == 0 || percent >= 100 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = elapsed / percent as f64 * (100 - percent) as f64;
        Some(remaining.round() as u64)
    }
}

fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
