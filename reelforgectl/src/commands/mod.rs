pub mod config;
pub mod jobs;

use std::path::Path;

use reelforge_core::{PipelineConfig, SqliteJobStore, StoreResult};

pub(crate) fn open_store(
    config: &PipelineConfig,
    override_path: Option<&Path>,
    read_only: bool,
) -> StoreResult<SqliteJobStore> {
    let path = match override_path {
        Some(path) => path.to_path_buf(),
        None => config.resolve_path(&config.paths.jobs_db),
    };
    SqliteJobStore::builder()
        .path(path)
        .read_only(read_only)
        .create_if_missing(!read_only)
        .build()
}
