mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use reelforge_core::load_pipeline_config;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] reelforge_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] reelforge_core::StoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] reelforge_core::SchedulerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: String, error: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Reelforge ingestion pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to the pipeline configuration
    #[arg(long, default_value = "configs/pipeline.toml")]
    pub config: PathBuf,
    /// Alternative path for the jobs database
    #[arg(long)]
    pub jobs_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a raw upload for ingestion and wait for the terminal state
    Submit(SubmitArgs),
    /// Show the durable record of one job
    Status(StatusArgs),
    /// Operations on stored job records
    #[command(subcommand)]
    Jobs(JobsCommands),
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Emit shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Raw uploaded video file
    #[arg(long)]
    pub input: PathBuf,
    /// Owner display name burned into the watermark
    #[arg(long)]
    pub owner: String,
    /// Job id; generated when omitted
    #[arg(long)]
    pub job_id: Option<String>,
    /// Print each progress event while waiting
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long)]
    pub job_id: String,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List stored job records
    List(JobsListArgs),
}

#[derive(Args, Debug)]
pub struct JobsListArgs {
    /// Filter by status (processing, ready, failed)
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of records returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the configuration
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "reelforgectl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let config = Arc::new(load_pipeline_config(&cli.config)?);
    match cli.command {
        Commands::Submit(args) => {
            commands::jobs::submit(config, cli.jobs_db.as_deref(), cli.format, args).await
        }
        Commands::Status(args) => {
            commands::jobs::status(&config, cli.jobs_db.as_deref(), cli.format, &args)
        }
        Commands::Jobs(JobsCommands::List(args)) => {
            commands::jobs::list(&config, cli.jobs_db.as_deref(), cli.format, &args)
        }
        Commands::Config(ConfigCommands::Check) => {
            commands::config::check(&config, &cli.config, cli.format)
        }
        Commands::Completions(_) => Ok(()),
    }
}
