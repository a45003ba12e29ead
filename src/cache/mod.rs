//! Cache indexes and eviction
//!
//! - [`PreprocessCache`]: raw source fingerprint -> job whose pre-processed
//!   text can be reused
//! - [`FileCache`]: caller-visible file id -> deduplicated content
//! - [`Evictor`]: applies an [`EvictionPolicy`] across all of the above
//!
//! Indexes are first-writer-wins. Eviction never removes an entry whose
//! referenced job is still in flight.

mod eviction;
mod files;

pub use eviction::*;
pub use files::*;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::meta::{self, JobDb};
use crate::registry::{SummaryStatus, Warnings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// When cache entries may be removed. Both unset means never.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Entries not flagged for caching are removed once idle this long
    pub uncached_idle: Option<Duration>,
    /// Upper bound on entries; least recently accessed go first
    pub max_entries: Option<usize>,
}

impl EvictionPolicy {
    pub fn is_noop(&self) -> bool {
        self.uncached_idle.is_none() && self.max_entries.is_none()
    }
}

/// Pick eviction victims.
///
/// `idle` are always removed. If `max_entries` is set and `total` minus the
/// idle victims still exceeds it, further victims are taken from `lru` (already
/// ordered, evictable entries only) until the bound holds or `lru` runs out.
pub(crate) fn select_victims(
    idle: Vec<String>,
    lru: Vec<String>,
    total: usize,
    max_entries: Option<usize>,
) -> Vec<String> {
    let mut victims = idle;
    if let Some(max) = max_entries {
        let excess = total.saturating_sub(victims.len()).saturating_sub(max);
        if excess > 0 {
            let chosen: HashSet<String> = victims.iter().cloned().collect();
            victims.extend(lru.into_iter().filter(|id| !chosen.contains(id)).take(excess));
        }
    }
    victims
}

/// A pre-processing cache entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PreprocessEntry {
    pub raw_id: String,
    pub preprocessed_id: String,
    pub cache: bool,
    pub last_accessed: String,
    pub warnings: Option<String>,
    pub created_at: String,
}

impl PreprocessEntry {
    pub fn get_warnings(&self) -> Result<Warnings> {
        match &self.warnings {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Warnings::new()),
        }
    }
}

/// Pre-processing cache index over the jobs database
#[derive(Clone)]
pub struct PreprocessCache {
    db: JobDb,
}

impl PreprocessCache {
    pub fn new(db: JobDb) -> Self {
        Self { db }
    }

    /// Find the entry for a raw source. A hit refreshes its access time.
    pub async fn lookup(&self, raw_id: &Fingerprint) -> Result<Option<PreprocessEntry>> {
        let entry = sqlx::query_as::<_, PreprocessEntry>(
            "SELECT * FROM raw_to_preprocessed WHERE raw_id = ?",
        )
        .bind(raw_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        if entry.is_some() {
            sqlx::query("UPDATE raw_to_preprocessed SET last_accessed = ? WHERE raw_id = ?")
                .bind(meta::now())
                .bind(raw_id.as_str())
                .execute(self.db.pool())
                .await?;
            debug!(raw_id = %raw_id, "Pre-processing cache hit");
        }
        Ok(entry)
    }

    /// Map a raw source to the job holding its pre-processed form.
    ///
    /// An existing mapping wins: it is kept, its access time refreshed and
    /// its cache flag upgraded if `cache` is set. Returns whether a new entry
    /// was written.
    pub async fn record(
        &self,
        raw_id: &Fingerprint,
        preprocessed_id: &str,
        warnings: Option<&Warnings>,
        cache: bool,
    ) -> Result<bool> {
        let now = meta::now();
        let warnings = match warnings {
            Some(w) if !w.is_empty() => Some(serde_json::to_string(w)?),
            _ => None,
        };

        let mut tx = self.db.pool().begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO raw_to_preprocessed (raw_id, preprocessed_id, cache, last_accessed, warnings, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(raw_id.as_str())
        .bind(preprocessed_id)
        .bind(cache)
        .bind(&now)
        .bind(warnings)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                "UPDATE raw_to_preprocessed SET last_accessed = ?, cache = (cache OR ?) WHERE raw_id = ?",
            )
            .bind(&now)
            .bind(cache)
            .bind(raw_id.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(raw_id = %raw_id, preprocessed_id, inserted, "Recorded pre-processing cache entry");
        Ok(inserted)
    }

    /// Remove entries under `policy`, least recently accessed first
    pub async fn evict(&self, policy: &EvictionPolicy, dry_run: bool) -> Result<u64> {
        if policy.is_noop() {
            return Ok(0);
        }
        let completed = SummaryStatus::Completed.to_string();

        let idle = match policy.uncached_idle {
            Some(age) => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT r.raw_id FROM raw_to_preprocessed r
                    JOIN summaries s ON s.summary_id = r.preprocessed_id
                    WHERE s.status = ? AND r.cache = 0 AND r.last_accessed <= ?
                    "#,
                )
                .bind(&completed)
                .bind(meta::cutoff(age)?)
                .fetch_all(self.db.pool())
                .await?
            }
            None => Vec::new(),
        };

        let (total, lru) = match policy.max_entries {
            Some(_) => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_to_preprocessed")
                    .fetch_one(self.db.pool())
                    .await?;
                let lru: Vec<String> = sqlx::query_scalar(
                    r#"
                    SELECT r.raw_id FROM raw_to_preprocessed r
                    JOIN summaries s ON s.summary_id = r.preprocessed_id
                    WHERE s.status = ?
                    ORDER BY r.last_accessed ASC
                    "#,
                )
                .bind(&completed)
                .fetch_all(self.db.pool())
                .await?;
                (total as usize, lru)
            }
            None => (0, Vec::new()),
        };

        let victims = select_victims(idle, lru, total, policy.max_entries);
        if dry_run || victims.is_empty() {
            return Ok(victims.len() as u64);
        }

        let mut tx = self.db.pool().begin().await?;
        let mut removed = 0;
        for raw_id in &victims {
            removed += sqlx::query("DELETE FROM raw_to_preprocessed WHERE raw_id = ?")
                .bind(raw_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        info!(removed, "Evicted pre-processing cache entries");
        Ok(removed)
    }
}
