use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use reelforge_core::{
    job_topic, BroadcastChannel, CommandExecutor, JobRecord, JobRecordStore, JobScheduler,
    JobStatus, PipelineConfig, StatusPublisher, SystemCommandExecutor, TranscodeJob,
    TranscodeOrchestrator, PROGRESS_EVENT, STATUS_EVENT,
};

use crate::{AppError, JobsListArgs, OutputFormat, Result, StatusArgs, SubmitArgs};

use super::open_store;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

pub async fn submit(
    config: Arc<PipelineConfig>,
    jobs_db: Option<&Path>,
    format: OutputFormat,
    args: SubmitArgs,
) -> Result<()> {
    let input = resolve_input(&config, &args.input)?;

    let store = open_store(&config, jobs_db, false)?;
    store.initialize()?;
    let store: Arc<dyn JobRecordStore> = Arc::new(store);
    let channel = Arc::new(BroadcastChannel::default());
    let mut events = channel.subscribe();
    let publisher = Arc::new(StatusPublisher::new(store.clone(), channel));
    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor);
    let orchestrator = Arc::new(TranscodeOrchestrator::new(
        config.clone(),
        executor,
        publisher.clone(),
    ));
    let scheduler = JobScheduler::new(orchestrator, store.clone(), publisher, config)?;

    let job = match args.job_id {
        Some(id) => TranscodeJob::new(id, &input, &args.owner),
        None => TranscodeJob::with_generated_id(&input, &args.owner),
    };
    let job_id = job.job_id.clone();
    scheduler.submit(job)?;

    let topic = job_topic(&job_id);
    loop {
        match events.recv().await {
            Ok(message) if message.topic == topic => match message.event.as_str() {
                PROGRESS_EVENT if args.follow => {
                    let progress = message.payload["progress"].as_u64().unwrap_or(0);
                    let stage = message.payload["stage"].as_str().unwrap_or("?");
                    println!("{progress:>3}%  {stage}");
                }
                STATUS_EVENT => break,
                _ => {}
            },
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    // The broadcast is best-effort; the record is authoritative.
    let record = loop {
        match store.fetch(&job_id)? {
            Some(record) if record.status.is_terminal() => break record,
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    };

    render_record(&record, format)?;
    if record.status == JobStatus::Failed {
        return Err(AppError::JobFailed {
            job_id,
            error: record.error.unwrap_or_else(|| "unknown failure".into()),
        });
    }
    Ok(())
}

pub fn status(
    config: &PipelineConfig,
    jobs_db: Option<&Path>,
    format: OutputFormat,
    args: &StatusArgs,
) -> Result<()> {
    let store = open_store(config, jobs_db, true)?;
    let record = store
        .fetch(&args.job_id)?
        .ok_or_else(|| AppError::MissingResource(format!("job record {}", args.job_id)))?;
    render_record(&record, format)
}

pub fn list(
    config: &PipelineConfig,
    jobs_db: Option<&Path>,
    format: OutputFormat,
    args: &JobsListArgs,
) -> Result<()> {
    let status = args
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let store = open_store(config, jobs_db, true)?;
    let records = store.list(status, args.limit)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            for record in &records {
                println!(
                    "{}  {:<10}  {:>3}%  {}",
                    record.job_id, record.status, record.progress_percent, record.stage
                );
            }
            println!("{} record(s)", records.len());
        }
    }
    Ok(())
}

/// Bare filenames are looked up in the configured ingest directory, so
/// `submit --input clip.mp4` works from anywhere on the host.
fn resolve_input(config: &PipelineConfig, input: &Path) -> Result<std::path::PathBuf> {
    if input.exists() {
        return input
            .canonicalize()
            .map_err(|_| AppError::MissingResource(format!("input file {}", input.display())));
    }
    if input.is_relative() {
        let staged = config
            .resolve_path(&config.paths.ingest_dir)
            .join(input);
        if staged.exists() {
            return Ok(staged);
        }
    }
    Err(AppError::MissingResource(format!(
        "input file {}",
        input.display()
    )))
}

fn render_record(record: &JobRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
        OutputFormat::Text => {
            println!("job:      {}", record.job_id);
            println!("status:   {}", record.status);
            println!("stage:    {}", record.stage);
            println!("progress: {}%", record.progress_percent);
            println!("retries:  {}", record.retry_count);
            if let Some(error) = &record.error {
                println!("error:    {error}");
            }
            if let Some(manifest) = &record.manifest_path {
                println!("manifest: {manifest}");
            }
            if let Some(thumbnail) = &record.thumbnail_path {
                println!("poster:   {thumbnail}");
            }
            if let Some(updated) = record.updated_at {
                println!("updated:  {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
    }
    Ok(())
}
