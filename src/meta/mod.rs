//! Durable storage handles
//!
//! precis keeps its state in two SQLite databases:
//! - `jobs.db`: reference data, sources, summaries and the pre-processing
//!   cache index
//! - `files.db`: deduplicated file content and the file cache index
//!
//! Each database is reached through its own handle ([`JobDb`], [`FileDb`]),
//! so a component holding one cannot touch the other's tables.

mod reference;
mod schema;

pub use reference::*;
pub use schema::*;

use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Current time in the stored timestamp format
pub fn now() -> String {
    format_timestamp(Utc::now())
}

/// RFC 3339 with fixed microsecond precision and a `Z` suffix, so that
/// lexical order equals chronological order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp '{}': {}", value, e)))
}

/// Timestamp `age` before now, for idle and deadline cutoffs
pub fn cutoff(age: Duration) -> Result<String> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| Error::Config(format!("duration out of range: {}", e)))?;
    Ok(format_timestamp(Utc::now() - age))
}

async fn open_pool(db_path: &Path, storage: &StorageConfig) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(storage.busy_timeout_ms))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    debug!("Connecting to SQLite database at {:?}", db_path);

    let pool = SqlitePoolOptions::new()
        .max_connections(storage.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let result: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?")
            .bind(table)
            .fetch_optional(pool)
            .await?;
    Ok(result.is_some())
}

/// Handle to the jobs database
#[derive(Clone)]
pub struct JobDb {
    pool: SqlitePool,
}

impl JobDb {
    /// Connect to the jobs database
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = open_pool(&config.paths.jobs_db, &config.storage).await?;
        Ok(Self { pool })
    }

    /// Connect and make sure the schema and reference data exist
    pub async fn open(config: &Config) -> Result<Self> {
        let db = Self::connect(config).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
            db.seed_reference(&config.reference).await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing jobs database schema");
        sqlx::query(JOBS_SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if the database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        table_exists(&self.pool, "summaries").await
    }

    /// Row counts across the jobs database
    pub async fn stats(&self) -> Result<JobDbStats> {
        let source_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(&self.pool)
            .await?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM summaries GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let preprocess_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_to_preprocessed")
            .fetch_one(&self.pool)
            .await?;

        let total_requests: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(request_count), 0) FROM summaries")
                .fetch_one(&self.pool)
                .await?;

        Ok(JobDbStats {
            source_count: source_count as usize,
            summary_count: by_status.iter().map(|(_, n)| *n as usize).sum(),
            summaries_by_status: by_status
                .into_iter()
                .map(|(status, n)| (status, n as usize))
                .collect(),
            preprocess_entries: preprocess_entries as usize,
            total_requests: total_requests as u64,
        })
    }
}

/// Handle to the files database
#[derive(Clone)]
pub struct FileDb {
    pool: SqlitePool,
}

impl FileDb {
    /// Connect to the files database
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = open_pool(&config.paths.files_db, &config.storage).await?;
        Ok(Self { pool })
    }

    /// Connect and make sure the schema exists
    pub async fn open(config: &Config) -> Result<Self> {
        let db = Self::connect(config).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing files database schema");
        sqlx::query(FILES_SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if the database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        table_exists(&self.pool, "file_to_content").await
    }

    /// Row counts across the files database
    pub async fn stats(&self) -> Result<FileDbStats> {
        let (content_count, content_bytes): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(content_length), 0) FROM content")
                .fetch_one(&self.pool)
                .await?;

        let file_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_to_content")
            .fetch_one(&self.pool)
            .await?;

        Ok(FileDbStats {
            file_count: file_count as usize,
            content_count: content_count as usize,
            content_bytes: content_bytes as u64,
        })
    }
}

/// Jobs database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDbStats {
    pub source_count: usize,
    pub summary_count: usize,
    pub summaries_by_status: Vec<(String, usize)>,
    pub preprocess_entries: usize,
    pub total_requests: u64,
}

/// Files database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDbStats {
    pub file_count: usize,
    pub content_count: usize,
    pub content_bytes: u64,
}


#[cfg(test)]
mod tests {
    use super::testing::setup_dbs;
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        let (a, b) = (format_timestamp(earlier), format_timestamp(later));
        assert!(a < b);
        assert!(a.ends_with('Z'));
        assert_eq!(format_timestamp(parse_timestamp(&a).unwrap()), a);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_open_initializes_both_databases() {
        let (jobs, files, config, _tmp) = setup_dbs().await;

        assert!(jobs.is_initialized().await.unwrap());
        assert!(files.is_initialized().await.unwrap());
        assert!(config.paths.jobs_db.exists());
        assert!(config.paths.files_db.exists());

        let stats = jobs.stats().await.unwrap();
        assert_eq!(stats.summary_count, 0);
        assert_eq!(stats.total_requests, 0);

        let stats = files.stats().await.unwrap();
        assert_eq!(stats.content_bytes, 0);
    }

    #[tokio::test]
    async fn test_schemas_are_separate() {
        let (jobs, files, _config, _tmp) = setup_dbs().await;

        let err = sqlx::query("SELECT COUNT(*) FROM content")
            .execute(jobs.pool())
            .await;
        assert!(err.is_err());

        let err = sqlx::query("SELECT COUNT(*) FROM summaries")
            .execute(files.pool())
            .await;
        assert!(err.is_err());
    }
}
