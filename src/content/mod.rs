//! Content stores
//!
//! Immutable, deduplicated payloads keyed by their fingerprint:
//! - [`SourceStore`]: normalized text in the jobs database
//! - [`FileContentStore`]: raw bytes in the files database
//!
//! There is no update operation. Rows disappear only through
//! [`ContentStore::collect_garbage`], once nothing references them.

use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::meta::{self, FileDb, JobDb};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::{debug, info};

/// A content-addressed, write-once store
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Borrowed form accepted by `put`
    type Content: ?Sized + Sync;

    /// Owned form returned by `get`
    type Owned: Send;

    /// Store content, returning its id. Storing the same content again
    /// returns the same id and writes nothing.
    async fn put(&self, content: &Self::Content) -> Result<Fingerprint>;

    /// Fetch content by id
    async fn get(&self, id: &Fingerprint) -> Result<Self::Owned>;

    /// Whether content with this id is stored
    async fn exists(&self, id: &Fingerprint) -> Result<bool>;

    /// Remove content no longer referenced by any index row. With
    /// `dry_run`, only count what would be removed.
    async fn collect_garbage(&self, dry_run: bool) -> Result<u64>;
}

/// Summarization sources in the jobs database
#[derive(Clone)]
pub struct SourceStore {
    db: JobDb,
}

impl SourceStore {
    pub fn new(db: JobDb) -> Self {
        Self { db }
    }
}

/// Insert already-normalized text on an open connection or transaction.
/// Returns whether a new row was written.
pub(crate) async fn insert_source(
    conn: &mut SqliteConnection,
    id: &Fingerprint,
    normalized: &str,
) -> Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO sources (source_id, content, content_length, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(source_id) DO NOTHING
        "#,
    )
    .bind(id.as_str())
    .bind(normalized)
    .bind(normalized.chars().count() as i64)
    .bind(meta::now())
    .execute(conn)
    .await?
    .rows_affected();

    Ok(inserted == 1)
}

const UNREFERENCED_SOURCES: &str = r#"
    FROM sources s
    WHERE NOT EXISTS (SELECT 1 FROM summaries WHERE source_id = s.source_id)
      AND NOT EXISTS (SELECT 1 FROM summaries WHERE preprocessed_source_id = s.source_id)
"#;

#[async_trait]
impl ContentStore for SourceStore {
    type Content = str;
    type Owned = String;

    async fn put(&self, content: &str) -> Result<Fingerprint> {
        let normalized = fingerprint::normalize_text(content)?;
        let id = fingerprint::source_fingerprint(&normalized);

        let mut conn = self.db.pool().acquire().await?;
        if insert_source(&mut conn, &id, &normalized).await? {
            debug!(source_id = %id, chars = normalized.chars().count(), "Stored source");
        }
        Ok(id)
    }

    async fn get(&self, id: &Fingerprint) -> Result<String> {
        let content: Option<String> =
            sqlx::query_scalar("SELECT content FROM sources WHERE source_id = ?")
                .bind(id.as_str())
                .fetch_optional(self.db.pool())
                .await?;
        content.ok_or_else(|| Error::NotFound(format!("source {}", id)))
    }

    async fn exists(&self, id: &Fingerprint) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM sources WHERE source_id = ?")
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(found.is_some())
    }

    async fn collect_garbage(&self, dry_run: bool) -> Result<u64> {
        let removed = if dry_run {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", UNREFERENCED_SOURCES))
                .fetch_one(self.db.pool())
                .await?;
            count as u64
        } else {
            sqlx::query(&format!(
                "DELETE FROM sources WHERE source_id IN (SELECT s.source_id {})",
                UNREFERENCED_SOURCES
            ))
            .execute(self.db.pool())
            .await?
            .rows_affected()
        };

        if removed > 0 {
            info!(removed, dry_run, "Collected unreferenced sources");
        }
        Ok(removed)
    }
}

/// Uploaded file bytes in the files database
#[derive(Clone)]
pub struct FileContentStore {
    db: FileDb,
}

impl FileContentStore {
    pub fn new(db: FileDb) -> Self {
        Self { db }
    }
}

const UNREFERENCED_CONTENT: &str = r#"
    FROM content c
    WHERE NOT EXISTS (SELECT 1 FROM file_to_content WHERE content_id = c.content_id)
"#;

#[async_trait]
impl ContentStore for FileContentStore {
    type Content = [u8];
    type Owned = Vec<u8>;

    async fn put(&self, content: &[u8]) -> Result<Fingerprint> {
        if content.is_empty() {
            return Err(Error::Validation("file content must not be empty".to_string()));
        }
        let id = fingerprint::file_fingerprint(content);

        let inserted = sqlx::query(
            r#"
            INSERT INTO content (content_id, data, content_length, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(content)
        .bind(content.len() as i64)
        .bind(meta::now())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if inserted == 1 {
            debug!(content_id = %id, bytes = content.len(), "Stored file content");
        }
        Ok(id)
    }

    async fn get(&self, id: &Fingerprint) -> Result<Vec<u8>> {
        let data: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT data FROM content WHERE content_id = ?")
                .bind(id.as_str())
                .fetch_optional(self.db.pool())
                .await?;
        data.ok_or_else(|| Error::NotFound(format!("content {}", id)))
    }

    async fn exists(&self, id: &Fingerprint) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM content WHERE content_id = ?")
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(found.is_some())
    }

    async fn collect_garbage(&self, dry_run: bool) -> Result<u64> {
        let removed = if dry_run {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", UNREFERENCED_CONTENT))
                .fetch_one(self.db.pool())
                .await?;
            count as u64
        } else {
            sqlx::query(&format!(
                "DELETE FROM content WHERE content_id IN (SELECT c.content_id {})",
                UNREFERENCED_CONTENT
            ))
            .execute(self.db.pool())
            .await?
            .rows_affected()
        };

        if removed > 0 {
            info!(removed, dry_run, "Collected unreferenced file content");
        }
        Ok(removed)
    }
}
