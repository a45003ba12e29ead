//! File cache index

use super::{select_victims, EvictionPolicy};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::meta::{self, FileDb};
use mime_guess::mime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Coarse file category, fixed when a file is first recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Document,
    Audio,
    Image,
    Video,
}

impl FileType {
    /// Guess the category from a file name. Anything that is not audio,
    /// image or video is a document.
    pub fn detect(name: &str) -> FileType {
        let guess = mime_guess::from_path(Path::new(name)).first();
        match guess.as_ref().map(|m| m.type_()) {
            Some(t) if t == mime::AUDIO => FileType::Audio,
            Some(t) if t == mime::IMAGE => FileType::Image,
            Some(t) if t == mime::VIDEO => FileType::Video,
            _ => FileType::Document,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::Document => write!(f, "document"),
            FileType::Audio => write!(f, "audio"),
            FileType::Image => write!(f, "image"),
            FileType::Video => write!(f, "video"),
        }
    }
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "document" => Ok(FileType::Document),
            "audio" => Ok(FileType::Audio),
            "image" => Ok(FileType::Image),
            "video" => Ok(FileType::Video),
            _ => Err(Error::Validation(format!("Unknown file type: {}", s))),
        }
    }
}

/// A file id -> content mapping
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: String,
    pub content_id: String,
    pub file_type: String,
    pub cache: bool,
    pub last_accessed: String,
    pub request_count: i64,
    pub created_at: String,
}

impl FileEntry {
    pub fn get_file_type(&self) -> Result<FileType> {
        self.file_type.parse()
    }
}

/// File cache index over the files database
#[derive(Clone)]
pub struct FileCache {
    db: FileDb,
}

impl FileCache {
    pub fn new(db: FileDb) -> Self {
        Self { db }
    }

    /// Find a file by id, counting the access
    pub async fn lookup(&self, file_id: &str) -> Result<Option<FileEntry>> {
        let updated = sqlx::query(
            "UPDATE file_to_content SET last_accessed = ?, request_count = request_count + 1 WHERE file_id = ?",
        )
        .bind(meta::now())
        .bind(file_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.get(file_id).await
    }

    /// Read a file entry without counting an access
    pub async fn get(&self, file_id: &str) -> Result<Option<FileEntry>> {
        let entry = sqlx::query_as::<_, FileEntry>("SELECT * FROM file_to_content WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(entry)
    }

    /// Map a file id to content.
    ///
    /// The first mapping for a file id wins. Repeating it counts a request,
    /// refreshes the access time and upgrades `cache` to true if asked; the
    /// stored content and file type never change. Returns the stored entry
    /// and whether it was created by this call.
    pub async fn record(
        &self,
        file_id: &str,
        content_id: &Fingerprint,
        file_type: FileType,
        cache: bool,
    ) -> Result<(FileEntry, bool)> {
        if file_id.trim().is_empty() {
            return Err(Error::Validation("file id must not be empty".to_string()));
        }
        let now = meta::now();

        let mut tx = self.db.pool().begin().await?;
        let created = sqlx::query(
            r#"
            INSERT INTO file_to_content (file_id, content_id, file_type, cache, last_accessed, request_count, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(file_id) DO NOTHING
            "#,
        )
        .bind(file_id)
        .bind(content_id.as_str())
        .bind(file_type.to_string())
        .bind(cache)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !created {
            sqlx::query(
                r#"
                UPDATE file_to_content
                SET last_accessed = ?, request_count = request_count + 1, cache = (cache OR ?)
                WHERE file_id = ?
                "#,
            )
            .bind(&now)
            .bind(cache)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        }

        let entry = sqlx::query_as::<_, FileEntry>("SELECT * FROM file_to_content WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(file_id, content_id = %entry.content_id, created, "Recorded file");
        Ok((entry, created))
    }

    /// Remove entries under `policy`: least recently accessed first, then
    /// fewest requests
    pub async fn evict(&self, policy: &EvictionPolicy, dry_run: bool) -> Result<u64> {
        if policy.is_noop() {
            return Ok(0);
        }

        let idle = match policy.uncached_idle {
            Some(age) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT file_id FROM file_to_content WHERE cache = 0 AND last_accessed <= ?",
                )
                .bind(meta::cutoff(age)?)
                .fetch_all(self.db.pool())
                .await?
            }
            None => Vec::new(),
        };

        let (total, lru) = match policy.max_entries {
            Some(_) => {
                let lru: Vec<String> = sqlx::query_scalar(
                    "SELECT file_id FROM file_to_content ORDER BY last_accessed ASC, request_count ASC",
                )
                .fetch_all(self.db.pool())
                .await?;
                (lru.len(), lru)
            }
            None => (0, Vec::new()),
        };

        let victims = select_victims(idle, lru, total, policy.max_entries);
        if dry_run || victims.is_empty() {
            return Ok(victims.len() as u64);
        }

        let mut tx = self.db.pool().begin().await?;
        let mut removed = 0;
        for file_id in &victims {
            removed += sqlx::query("DELETE FROM file_to_content WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        info!(removed, "Evicted file cache entries");
        Ok(removed)
    }
}
