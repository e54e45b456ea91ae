use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::pipeline::{
    stages, PipelineOutputs, PipelineResult, RetryPolicy, TranscodeJob, TranscodeOrchestrator,
};
use crate::publish::StatusPublisher;
use crate::store::{JobRecordStore, JobStatus, JobUpdate};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {job_id} is already queued or running")]
    Duplicate { job_id: String },
    #[error("job {job_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// One pipeline attempt. The orchestrator is the production implementation;
/// tests substitute instrumented runners.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &TranscodeJob) -> PipelineResult<PipelineOutputs>;
}

#[async_trait]
impl JobRunner for TranscodeOrchestrator {
    async fn run(&self, job: &TranscodeJob) -> PipelineResult<PipelineOutputs> {
        TranscodeOrchestrator::run(self, job).await
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<TranscodeJob>,
    active: usize,
    live: HashSet<String>,
}

struct SchedulerInner {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn JobRecordStore>,
    publisher: Arc<StatusPublisher>,
    config: Arc<PipelineConfig>,
    retry: RetryPolicy,
    state: Mutex<SchedulerState>,
}

/// Bounded-concurrency FIFO scheduler. The queue, the active count, and the
/// live-id set share one mutex so two tasks can never both claim the last
/// free slot. Submission is non-blocking; draining happens on submit and on
/// every slot release.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn JobRecordStore>,
        publisher: Arc<StatusPublisher>,
        config: Arc<PipelineConfig>,
    ) -> SchedulerResult<Self> {
        let retry = RetryPolicy::try_from(&config.retry)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                runner,
                store,
                publisher,
                config,
                retry,
                state: Mutex::new(SchedulerState::default()),
            }),
        })
    }

    /// Enqueues a job and returns immediately. The initial durable record is
    /// written here, before the job becomes runnable.
    pub fn submit(&self, job: TranscodeJob) -> SchedulerResult<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.live.contains(&job.job_id) {
                return Err(SchedulerError::Duplicate {
                    job_id: job.job_id.clone(),
                });
            }
            state.live.insert(job.job_id.clone());
        }
        if let Err(error) = self.inner.store.create(&job) {
            warn!(job_id = %job.job_id, %error, "failed to persist initial job record");
        }
        info!(job_id = %job.job_id, input = %job.input_path.display(), "job submitted");
        {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(job);
        }
        SchedulerInner::drain(&self.inner);
        Ok(())
    }

    /// Jobs waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    /// True once no submitted job is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.queue.is_empty() && state.active == 0
    }
}

impl SchedulerInner {
    fn drain(inner: &Arc<Self>) {
        loop {
            let job = {
                let mut state = inner.state.lock().unwrap();
                if state.active >= inner.config.limits.max_concurrent_jobs as usize {
                    return;
                }
                let Some(job) = state.queue.pop_front() else {
                    return;
                };
                state.active += 1;
                job
            };
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let _slot = SlotGuard {
                    inner: Arc::clone(&inner),
                    job_id: job.job_id.clone(),
                };
                inner.execute(&job).await;
            });
        }
    }

    async fn execute(&self, job: &TranscodeJob) {
        let attempt_budget = Duration::from_secs(self.config.limits.job_timeout_minutes * 60);
        let max_attempts = self.retry.max_attempts;
        let mut last_error = String::new();
        let mut last_detail = String::new();

        for attempt in 1..=max_attempts {
            if let Err(error) = self.store.update(
                &job.job_id,
                &JobUpdate::default().retry_count(attempt - 1),
            ) {
                warn!(job_id = %job.job_id, %error, "failed to persist attempt counter");
            }
            self.publisher.publish_progress(
                &job.job_id,
                0,
                stages::INITIALIZING,
                Some(json!({ "attempt": attempt })),
            );

            match timeout(attempt_budget, self.runner.run(job)).await {
                Ok(Ok(outputs)) => {
                    self.finish_ready(job, &outputs, attempt);
                    return;
                }
                Ok(Err(pipeline_error)) => {
                    warn!(
                        job_id = %job.job_id,
                        attempt,
                        error = %pipeline_error,
                        "pipeline attempt failed"
                    );
                    last_detail = pipeline_error.to_string();
                    last_error = pipeline_error.summary();
                }
                Err(_) => {
                    warn!(
                        job_id = %job.job_id,
                        attempt,
                        budget_minutes = self.config.limits.job_timeout_minutes,
                        "pipeline attempt timed out"
                    );
                    last_error = format!(
                        "transcode exceeded the {} minute limit",
                        self.config.limits.job_timeout_minutes
                    );
                    last_detail = last_error.clone();
                }
            }

            if attempt < max_attempts {
                let delay = self.retry.compute_delay(attempt);
                warn!(job_id = %job.job_id, attempt, wait = ?delay, "retrying job");
                sleep(delay).await;
            }
        }

        self.finish_failed(job, max_attempts, last_error, &last_detail)
            .await;
    }

    fn finish_ready(&self, job: &TranscodeJob, outputs: &PipelineOutputs, attempt: u32) {
        // Status and outputs land in one write so a polling reader never
        // observes outputs on a processing record.
        let update = JobUpdate::default()
            .status(JobStatus::Ready)
            .stage(stages::READY)
            .progress(100)
            .retry_count(attempt - 1)
            .outputs(&outputs.manifest_path, &outputs.thumbnail_path);
        if let Err(error) = self.store.update(&job.job_id, &update) {
            warn!(job_id = %job.job_id, %error, "failed to persist job outputs");
        }
        self.publisher.publish_status(&job.job_id, JobStatus::Ready);
        info!(
            job_id = %job.job_id,
            manifest = %outputs.manifest_path.display(),
            "job ready"
        );
    }

    async fn finish_failed(
        &self,
        job: &TranscodeJob,
        attempts: u32,
        last_error: String,
        last_detail: &str,
    ) {
        let exhausted = SchedulerError::Exhausted {
            job_id: job.job_id.clone(),
            attempts,
            last_error: last_error.clone(),
        };
        error!(job_id = %job.job_id, %exhausted, "job failed terminally");
        // The record carries the sanitised summary; the full detail stays
        // server-side.
        self.log_failure(&job.job_id, last_detail);

        if self.config.cleanup.purge_outputs_on_failure {
            let output_dir = self
                .config
                .resolve_path(&self.config.paths.storage_dir)
                .join(&job.job_id);
            if output_dir.exists() {
                if let Err(error) = tokio::fs::remove_dir_all(&output_dir).await {
                    warn!(job_id = %job.job_id, %error, "failed to purge partial outputs");
                }
            }
        }
        if self.config.cleanup.remove_input_on_failure {
            remove_input(&job.input_path, &job.job_id).await;
        }

        let update = JobUpdate::default()
            .status(JobStatus::Failed)
            .stage(stages::FAILED)
            .retry_count(attempts)
            .error(last_error);
        if let Err(error) = self.store.update(&job.job_id, &update) {
            warn!(job_id = %job.job_id, %error, "failed to persist terminal failure");
        }
        self.publisher.publish_status(&job.job_id, JobStatus::Failed);
    }

    fn log_failure(&self, job_id: &str, detail: &str) {
        let log_path = self
            .config
            .resolve_path(&self.config.paths.logs_dir)
            .join("pipeline_failures.log");
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), job_id, detail);
        }
    }
}

async fn remove_input(input_path: &Path, job_id: &str) {
    match tokio::fs::remove_file(input_path).await {
        Ok(()) => info!(job_id, input = %input_path.display(), "raw input removed"),
        Err(error) => warn!(job_id, %error, "failed to remove raw input"),
    }
}

/// Releases the concurrency slot when an execution task finishes for any
/// reason, then immediately re-drains the queue.
struct SlotGuard {
    inner: Arc<SchedulerInner>,
    job_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.active = state.active.saturating_sub(1);
            state.live.remove(&self.job_id);
        }
        SchedulerInner::drain(&self.inner);
    }
}
