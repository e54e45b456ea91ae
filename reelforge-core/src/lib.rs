pub mod config;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use config::{
    load_pipeline_config, LadderTier, PipelineConfig, ThumbnailStrategy,
};
pub use error::{ConfigError, Result};
pub use pipeline::{
    stages, AssetError, CommandExecutor, MediaMetadata, MediaProbe, PipelineError,
    PipelineOutputs, PipelineResult, ProbeError, RetryPolicy, SystemCommandExecutor,
    ThumbnailError, ThumbnailSampler, TranscodeError, TranscodeJob, TranscodeOrchestrator,
    WatermarkAssetManager, WatermarkAssets, MASTER_PLAYLIST_NAME, POSTER_FILE_NAME,
};
pub use publish::{
    job_topic, BroadcastChannel, ChannelMessage, NullChannel, RealtimeChannel, StatusPublisher,
    PROGRESS_EVENT, STATUS_EVENT,
};
pub use scheduler::{JobRunner, JobScheduler, SchedulerError, SchedulerResult};
pub use store::{
    JobRecord, JobRecordStore, JobStatus, JobUpdate, SqliteJobStore, SqliteJobStoreBuilder,
    StoreError, StoreResult,
};
