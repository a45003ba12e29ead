//! Custom error types for precis

use thiserror::Error;

/// Main error type for precis operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A completion event for a stage the job has already moved past
    #[error("Stale delivery for job {job_id}: {detail}")]
    StaleDelivery { job_id: String, detail: String },

    #[error("Job {job_id} exceeded its deadline in stage '{stage}' ({elapsed_secs}s)")]
    Timeout {
        job_id: String,
        stage: String,
        elapsed_secs: i64,
    },

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Not initialized: run 'precis init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether redelivering the triggering event may succeed later.
    ///
    /// Only faults in the event itself are final. Storage and bus failures
    /// of any kind may clear on a later delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::StaleDelivery { .. }
        )
    }
}

/// SQLite lock contention and unique-key races lost to another writer
pub(crate) fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                return true;
            }
            let message = db_err.message().to_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for precis
pub type Result<T> = std::result::Result<T, Error>;
