use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::TranscodeJob;
use crate::sqlite::configure_connection;

const JOBS_SCHEMA: &str = include_str!("../../sql/jobs.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open jobs database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on jobs database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("jobs database path not configured")]
    MissingStore,
    #[error("invalid job status: {0}")]
    InvalidStatus(String),
    #[error("job record not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub input_path: String,
    pub owner_name: String,
    pub status: JobStatus,
    pub stage: String,
    pub progress_percent: u8,
    pub retry_count: u32,
    pub error: Option<String>,
    pub manifest_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get("job_id")?,
            input_path: row.get("input_path")?,
            owner_name: row.get("owner_name")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Processing),
            stage: row.get("stage")?,
            progress_percent: row.get::<_, i64>("progress_percent")?.clamp(0, 100) as u8,
            retry_count: row.get::<_, i64>("retry_count")?.max(0) as u32,
            error: row.get("error")?,
            manifest_path: row.get("manifest_path")?,
            thumbnail_path: row.get("thumbnail_path")?,
            created_at: parse_timestamp(row.get("created_at")?)?,
            updated_at: parse_timestamp(row.get("updated_at")?)?,
        })
    }
}

/// Partial update applied to a job record. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub stage: Option<String>,
    pub progress_percent: Option<u8>,
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub manifest_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
}

impl JobUpdate {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn progress(mut self, percent: u8) -> Self {
        self.progress_percent = Some(percent.min(100));
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn outputs(mut self, manifest: impl Into<PathBuf>, thumbnail: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(manifest.into());
        self.thumbnail_path = Some(thumbnail.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.stage.is_none()
            && self.progress_percent.is_none()
            && self.retry_count.is_none()
            && self.error.is_none()
            && self.manifest_path.is_none()
            && self.thumbnail_path.is_none()
    }
}

/// Durable job state consumed by polling clients. The pipeline itself is
/// write-only against this store; reads exist for the CLI and for tests.
pub trait JobRecordStore: Send + Sync {
    /// Registers a fresh submission, resetting any previous record under
    /// the same id.
    fn create(&self, job: &TranscodeJob) -> StoreResult<()>;

    /// Applies a partial update. Records in a terminal status are never
    /// modified; late best-effort writes land as no-ops.
    fn update(&self, job_id: &str, update: &JobUpdate) -> StoreResult<()>;

    fn fetch(&self, job_id: &str) -> StoreResult<Option<JobRecord>>;

    fn list(&self, status: Option<JobStatus>, limit: usize) -> StoreResult<Vec<JobRecord>>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJobStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJobStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteJobStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteJobStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteJobStore {
    pub fn builder() -> SqliteJobStoreBuilder {
        SqliteJobStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteJobStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }
}

impl JobRecordStore for SqliteJobStore {
    fn create(&self, job: &TranscodeJob) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO transcode_jobs (job_id, input_path, owner_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET
                 input_path = excluded.input_path,
                 owner_name = excluded.owner_name,
                 status = 'processing',
                 stage = 'initializing',
                 progress_percent = 0,
                 retry_count = 0,
                 error = NULL,
                 manifest_path = NULL,
                 thumbnail_path = NULL,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                &job.job_id,
                job.input_path.to_string_lossy(),
                &job.owner_display_name
            ],
        )?;
        Ok(())
    }

    fn update(&self, job_id: &str, update: &JobUpdate) -> StoreResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.open()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM transcode_jobs WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(job_id.to_string()));
        };
        if matches!(current.parse(), Ok(JobStatus::Ready) | Ok(JobStatus::Failed)) {
            return Ok(());
        }

        let mut assignments = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = update.status {
            assignments.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(stage) = &update.stage {
            assignments.push("stage = ?");
            values.push(Value::Text(stage.clone()));
        }
        if let Some(percent) = update.progress_percent {
            assignments.push("progress_percent = ?");
            values.push(Value::Integer(percent.min(100) as i64));
        }
        if let Some(count) = update.retry_count {
            assignments.push("retry_count = ?");
            values.push(Value::Integer(count as i64));
        }
        if let Some(error) = &update.error {
            assignments.push("error = ?");
            values.push(Value::Text(error.clone()));
        }
        if let Some(manifest) = &update.manifest_path {
            assignments.push("manifest_path = ?");
            values.push(Value::Text(manifest.to_string_lossy().to_string()));
        }
        if let Some(thumbnail) = &update.thumbnail_path {
            assignments.push("thumbnail_path = ?");
            values.push(Value::Text(thumbnail.to_string_lossy().to_string()));
        }
        let query = format!(
            "UPDATE transcode_jobs SET {}, updated_at = CURRENT_TIMESTAMP WHERE job_id = ?",
            assignments.join(", ")
        );
        values.push(Value::Text(job_id.to_string()));
        let affected = conn.execute(
            &query,
            rusqlite::params_from_iter(values.iter().map(|value| value as &dyn rusqlite::ToSql)),
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn fetch(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM transcode_jobs WHERE job_id = ?1")?;
        let mut rows = stmt.query([job_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(JobRecord::from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> StoreResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM transcode_jobs");
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = status {
            query.push_str(" WHERE status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            values.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(JobRecord::from_row(row)?);
        }
        Ok(records)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
