//! Job registry
//!
//! Durable record of summarization jobs and their state machine:
//!
//! ```text
//! preprocessing -> encoding -> summarizing -> postprocessing -> completed
//! ```
//!
//! Every mutation is a single SQLite statement or transaction guarded by the
//! job fingerprint's primary key or a compare-and-swap on `status`, so any
//! number of dispatcher replicas can share one database.

use crate::cache::{self, EvictionPolicy};
use crate::error::{is_contention, Error, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::meta::{self, JobDb, JobDbStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Structured diagnostics, keyed by the field they concern
pub type Warnings = BTreeMap<String, Vec<String>>;

/// Merge `incoming` into `into`: lists are concatenated for keys present in
/// both, new keys are added.
pub fn merge_warnings(into: &mut Warnings, incoming: Warnings) {
    for (key, mut messages) in incoming {
        into.entry(key).or_default().append(&mut messages);
    }
}

/// Job status, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Preprocessing,
    Encoding,
    Summarizing,
    Postprocessing,
    Completed,
}

impl SummaryStatus {
    /// The status that follows this one, if any
    pub fn next(self) -> Option<SummaryStatus> {
        match self {
            SummaryStatus::Preprocessing => Some(SummaryStatus::Encoding),
            SummaryStatus::Encoding => Some(SummaryStatus::Summarizing),
            SummaryStatus::Summarizing => Some(SummaryStatus::Postprocessing),
            SummaryStatus::Postprocessing => Some(SummaryStatus::Completed),
            SummaryStatus::Completed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SummaryStatus::Completed
    }

    /// The pipeline stage running while a job is in this status
    pub fn stage(self) -> Option<Stage> {
        match self {
            SummaryStatus::Preprocessing => Some(Stage::Preprocessing),
            SummaryStatus::Encoding => Some(Stage::Encoding),
            SummaryStatus::Summarizing => Some(Stage::Summarizing),
            SummaryStatus::Postprocessing => Some(Stage::Postprocessing),
            SummaryStatus::Completed => None,
        }
    }
}

impl std::fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryStatus::Preprocessing => write!(f, "preprocessing"),
            SummaryStatus::Encoding => write!(f, "encoding"),
            SummaryStatus::Summarizing => write!(f, "summarizing"),
            SummaryStatus::Postprocessing => write!(f, "postprocessing"),
            SummaryStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for SummaryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "preprocessing" => Ok(SummaryStatus::Preprocessing),
            "encoding" => Ok(SummaryStatus::Encoding),
            "summarizing" => Ok(SummaryStatus::Summarizing),
            "postprocessing" => Ok(SummaryStatus::Postprocessing),
            "completed" => Ok(SummaryStatus::Completed),
            _ => Err(Error::Validation(format!("Unknown summary status: {}", s))),
        }
    }
}

/// An external pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocessing,
    Encoding,
    Summarizing,
    Postprocessing,
}

impl Stage {
    /// Status of a job while this stage runs
    pub fn status(self) -> SummaryStatus {
        match self {
            Stage::Preprocessing => SummaryStatus::Preprocessing,
            Stage::Encoding => SummaryStatus::Encoding,
            Stage::Summarizing => SummaryStatus::Summarizing,
            Stage::Postprocessing => SummaryStatus::Postprocessing,
        }
    }

    /// Status a job moves to once this stage completes
    pub fn completes_into(self) -> SummaryStatus {
        match self {
            Stage::Preprocessing => SummaryStatus::Encoding,
            Stage::Encoding => SummaryStatus::Summarizing,
            Stage::Summarizing => SummaryStatus::Postprocessing,
            Stage::Postprocessing => SummaryStatus::Completed,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.status().fmt(f)
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SummaryStatus>()?
            .stage()
            .ok_or_else(|| Error::Validation(format!("Not a pipeline stage: {}", s)))
    }
}

/// A summary job row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Summary {
    pub summary_id: String,
    pub source_id: String,
    pub summary: Option<String>,
    pub summary_length: Option<i64>,
    pub model_name: String,
    pub params: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub language_tag: String,
    pub request_count: i64,
    pub warnings: Option<String>,
    pub cache: bool,
    pub last_accessed: String,
    pub status_changed_at: String,
    pub preprocessed_source_id: Option<String>,
    pub stage_payload: Option<String>,
}

impl Summary {
    pub fn get_status(&self) -> Result<SummaryStatus> {
        self.status.parse()
    }

    pub fn get_warnings(&self) -> Result<Warnings> {
        match &self.warnings {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Warnings::new()),
        }
    }

    pub fn get_params(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.params)?)
    }

    pub fn get_stage_payload(&self) -> Result<Option<Value>> {
        self.stage_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Error::from)
    }
}

/// Identity and inputs of a job, derived from a client request
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub summary_id: Fingerprint,
    pub source_id: Fingerprint,
    /// Normalized source text
    pub source: String,
    pub model: String,
    /// Canonical params JSON
    pub params: String,
    pub language: String,
    pub cache: bool,
}

impl JobSpec {
    /// Normalize and fingerprint a request's inputs
    pub fn new(source: &str, model: &str, params: &Value, language: &str, cache: bool) -> Result<Self> {
        let source = fingerprint::normalize_text(source)?;
        let params = fingerprint::canonical_params(params)?;
        Ok(Self {
            summary_id: fingerprint::summary_fingerprint(&source, model, &params, language),
            source_id: fingerprint::source_fingerprint(&source),
            source,
            model: model.to_string(),
            params,
            language: language.to_string(),
            cache,
        })
    }
}

/// Data carried by a state transition
#[derive(Debug, Clone, Default)]
pub struct Partial {
    /// Output of the stage that just finished
    pub stage_payload: Option<Value>,
    /// Normalized pre-processed text. Stored as a source in the same
    /// transaction as the status change.
    pub preprocessed_source: Option<String>,
    /// Diagnostics to merge into the job's warnings
    pub warnings: Option<Warnings>,
    /// Final summary text; required when entering `completed`
    pub summary: Option<String>,
}

/// Result of a successful `advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    /// Redelivery of the terminal event with the same result
    Unchanged,
}

#[derive(Debug, PartialEq, Eq)]
enum Transition {
    Forward,
    TerminalRepeat,
    Stale,
    Illegal,
}

fn classify(current: SummaryStatus, new: SummaryStatus) -> Transition {
    if current.next() == Some(new) {
        Transition::Forward
    } else if current.is_terminal() && new.is_terminal() {
        Transition::TerminalRepeat
    } else if new == SummaryStatus::Preprocessing {
        Transition::Illegal
    } else if new <= current {
        Transition::Stale
    } else {
        Transition::Illegal
    }
}

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<SummaryStatus>,
    pub limit: Option<usize>,
}

/// The job registry over the jobs database
#[derive(Clone)]
pub struct JobRegistry {
    db: JobDb,
}

impl JobRegistry {
    pub fn new(db: JobDb) -> Self {
        Self { db }
    }

    /// Find or create the job for `spec`, counting the request.
    ///
    /// Returns the job and whether this call created it. Exactly one caller
    /// observes `created = true` per fingerprint.
    pub async fn get_or_create(&self, spec: &JobSpec) -> Result<(Summary, bool)> {
        match self.try_get_or_create(spec).await {
            Err(Error::Database(err)) if is_contention(&err) => {
                warn!(summary_id = %spec.summary_id, error = %err, "Job creation raced, retrying");
                match self.try_get_or_create(spec).await {
                    Err(Error::Database(err)) if is_contention(&err) => Err(Error::Conflict(
                        format!("concurrent creation of job {}: {}", spec.summary_id, err),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_get_or_create(&self, spec: &JobSpec) -> Result<(Summary, bool)> {
        let now = meta::now();
        let mut tx = self.db.pool().begin().await?;

        crate::content::insert_source(&mut *tx, &spec.source_id, &spec.source).await?;

        let created = sqlx::query(
            r#"
            INSERT INTO summaries (
                summary_id, source_id, model_name, params, status, started_at,
                language_tag, request_count, cache, last_accessed, status_changed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(summary_id) DO NOTHING
            "#,
        )
        .bind(spec.summary_id.as_str())
        .bind(spec.source_id.as_str())
        .bind(&spec.model)
        .bind(&spec.params)
        .bind(SummaryStatus::Preprocessing.to_string())
        .bind(&now)
        .bind(&spec.language)
        .bind(spec.cache)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        sqlx::query(
            r#"
            UPDATE summaries
            SET request_count = request_count + 1,
                cache = (cache OR ?),
                last_accessed = ?
            WHERE summary_id = ?
            "#,
        )
        .bind(spec.cache)
        .bind(&now)
        .bind(spec.summary_id.as_str())
        .execute(&mut *tx)
        .await?;

        let job = sqlx::query_as::<_, Summary>("SELECT * FROM summaries WHERE summary_id = ?")
            .bind(spec.summary_id.as_str())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            summary_id = %spec.summary_id,
            created,
            request_count = job.request_count,
            "Resolved job"
        );
        Ok((job, created))
    }

    /// Get a job by id
    pub async fn get(&self, job_id: &str) -> Result<Option<Summary>> {
        let job = sqlx::query_as::<_, Summary>("SELECT * FROM summaries WHERE summary_id = ?")
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(job)
    }

    async fn require(&self, job_id: &str) -> Result<Summary> {
        self.get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    /// Move a job to `new_status`.
    ///
    /// Only the immediate successor of the current status is applied.
    /// Re-applying `completed` with the same summary is a no-op. A status the
    /// job has already reached yields [`Error::StaleDelivery`]; anything else
    /// is a [`Error::Conflict`].
    pub async fn advance(
        &self,
        job_id: &str,
        new_status: SummaryStatus,
        partial: Partial,
    ) -> Result<AdvanceOutcome> {
        loop {
            let job = self.require(job_id).await?;
            let current = job.get_status()?;

            match classify(current, new_status) {
                Transition::Forward => {
                    if self.compare_and_swap(&job, current, new_status, &partial).await? {
                        info!(summary_id = %job_id, from = %current, to = %new_status, "Advanced job");
                        return Ok(AdvanceOutcome::Advanced);
                    }
                    debug!(summary_id = %job_id, from = %current, "Lost advance race, re-reading");
                }
                Transition::TerminalRepeat => {
                    return if partial.summary.is_some() && partial.summary == job.summary {
                        Ok(AdvanceOutcome::Unchanged)
                    } else {
                        Err(Error::Conflict(format!(
                            "job {} already completed with a different result",
                            job_id
                        )))
                    };
                }
                Transition::Stale => {
                    return Err(Error::StaleDelivery {
                        job_id: job_id.to_string(),
                        detail: format!("job is {}, cannot move to {}", current, new_status),
                    });
                }
                Transition::Illegal => {
                    return Err(Error::Conflict(format!(
                        "illegal transition for job {}: {} -> {}",
                        job_id, current, new_status
                    )));
                }
            }
        }
    }

    /// Complete a job still in `preprocessing` with the result of `donor`,
    /// a completed job with the same model, params and language whose input
    /// pre-processed to the same text.
    ///
    /// The donor's warnings are merged after those in `partial`. A job that
    /// has already left `preprocessing` yields [`Error::StaleDelivery`].
    pub async fn complete_from(
        &self,
        job_id: &str,
        donor: &Summary,
        mut partial: Partial,
    ) -> Result<AdvanceOutcome> {
        let job = self.require(job_id).await?;
        let current = job.get_status()?;
        let stale = |current: SummaryStatus| Error::StaleDelivery {
            job_id: job_id.to_string(),
            detail: format!("job is {}, cannot reuse the result of {}", current, donor.summary_id),
        };
        if current != SummaryStatus::Preprocessing {
            return Err(stale(current));
        }

        let donor_warnings = donor.get_warnings()?;
        if !donor_warnings.is_empty() {
            merge_warnings(partial.warnings.get_or_insert_with(Warnings::new), donor_warnings);
        }
        partial.summary = donor.summary.clone();
        partial.stage_payload = None;

        if self
            .compare_and_swap(&job, current, SummaryStatus::Completed, &partial)
            .await?
        {
            info!(summary_id = %job_id, donor = %donor.summary_id, "Completed job from an equivalent result");
            return Ok(AdvanceOutcome::Advanced);
        }

        let moved = self.require(job_id).await?.get_status()?;
        Err(stale(moved))
    }

    /// The most recently finished completed job, other than `job`, for the
    /// same model, params and language whose raw or pre-processed source is
    /// `source_id`
    pub async fn find_completed(&self, job: &Summary, source_id: &Fingerprint) -> Result<Option<Summary>> {
        let found = sqlx::query_as::<_, Summary>(
            r#"
            SELECT * FROM summaries
            WHERE status = ?
              AND model_name = ? AND params = ? AND language_tag = ?
              AND summary_id != ?
              AND (source_id = ? OR preprocessed_source_id = ?)
            ORDER BY ended_at DESC
            LIMIT 1
            "#,
        )
        .bind(SummaryStatus::Completed.to_string())
        .bind(&job.model_name)
        .bind(&job.params)
        .bind(&job.language_tag)
        .bind(&job.summary_id)
        .bind(source_id.as_str())
        .bind(source_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(found)
    }

    async fn compare_and_swap(
        &self,
        job: &Summary,
        current: SummaryStatus,
        new_status: SummaryStatus,
        partial: &Partial,
    ) -> Result<bool> {
        let now = meta::now();

        let mut warnings = job.get_warnings()?;
        if let Some(incoming) = partial.warnings.clone() {
            merge_warnings(&mut warnings, incoming);
        }
        let warnings = if warnings.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&warnings)?)
        };

        let (summary, summary_length, ended_at, stage_payload) = if new_status.is_terminal() {
            let text = partial.summary.as_deref().ok_or_else(|| {
                Error::Validation(format!("completing job {} requires a summary", job.summary_id))
            })?;
            (
                Some(text.to_string()),
                Some(text.chars().count() as i64),
                Some(now.clone()),
                None,
            )
        } else {
            let payload = match &partial.stage_payload {
                Some(value) => Some(serde_json::to_string(value)?),
                None => job.stage_payload.clone(),
            };
            (None, None, None, payload)
        };

        let mut tx = self.db.pool().begin().await?;

        let preprocessed_id = match partial.preprocessed_source.as_deref() {
            Some(text) => {
                let id = fingerprint::source_fingerprint(text);
                crate::content::insert_source(&mut *tx, &id, text).await?;
                Some(id)
            }
            None => None,
        };

        let updated = sqlx::query(
            r#"
            UPDATE summaries
            SET status = ?,
                status_changed_at = ?,
                warnings = ?,
                stage_payload = ?,
                preprocessed_source_id = COALESCE(?, preprocessed_source_id),
                summary = ?,
                summary_length = ?,
                ended_at = ?
            WHERE summary_id = ? AND status = ?
            "#,
        )
        .bind(new_status.to_string())
        .bind(&now)
        .bind(warnings)
        .bind(stage_payload)
        .bind(preprocessed_id.as_ref().map(|id| id.as_str()))
        .bind(summary)
        .bind(summary_length)
        .bind(ended_at)
        .bind(&job.summary_id)
        .bind(current.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // A lost race rolls back with the dropped transaction
        if updated != 1 {
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Record a served read of a job
    pub async fn touch(&self, job_id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE summaries SET last_accessed = ?, request_count = request_count + 1 WHERE summary_id = ?",
        )
        .bind(meta::now())
        .bind(job_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    /// Delete a completed job. Its pre-processing cache entries go with it.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let job = self.require(job_id).await?;
        if !job.get_status()?.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {} is still {}",
                job_id, job.status
            )));
        }

        let deleted = sqlx::query("DELETE FROM summaries WHERE summary_id = ? AND status = ?")
            .bind(job_id)
            .bind(SummaryStatus::Completed.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(Error::NotFound(format!("job {}", job_id)));
        }
        info!(summary_id = %job_id, "Deleted job");
        Ok(())
    }

    /// List jobs, most recently started first
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Summary>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let jobs = match filter.status {
            Some(status) => {
                sqlx::query_as::<_, Summary>(
                    "SELECT * FROM summaries WHERE status = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(status.to_string())
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Summary>(
                    "SELECT * FROM summaries ORDER BY started_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
        };
        Ok(jobs)
    }

    /// Non-terminal jobs that have not changed status for at least `deadline`
    pub async fn stalled(&self, deadline: Duration) -> Result<Vec<Summary>> {
        let jobs = sqlx::query_as::<_, Summary>(
            r#"
            SELECT * FROM summaries
            WHERE status != ? AND status_changed_at <= ?
            ORDER BY status_changed_at
            "#,
        )
        .bind(SummaryStatus::Completed.to_string())
        .bind(meta::cutoff(deadline)?)
        .fetch_all(self.db.pool())
        .await?;
        Ok(jobs)
    }

    /// Remove completed jobs under `policy`. In-flight jobs are never touched.
    pub async fn evict(&self, policy: &EvictionPolicy, dry_run: bool) -> Result<u64> {
        if policy.is_noop() {
            return Ok(0);
        }

        let idle = match policy.uncached_idle {
            Some(age) => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT summary_id FROM summaries
                    WHERE status = ? AND cache = 0 AND last_accessed <= ?
                    "#,
                )
                .bind(SummaryStatus::Completed.to_string())
                .bind(meta::cutoff(age)?)
                .fetch_all(self.db.pool())
                .await?
            }
            None => Vec::new(),
        };

        let (total, lru) = match policy.max_entries {
            Some(_) => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summaries")
                    .fetch_one(self.db.pool())
                    .await?;
                let lru: Vec<String> = sqlx::query_scalar(
                    r#"
                    SELECT summary_id FROM summaries
                    WHERE status = ?
                    ORDER BY last_accessed ASC, request_count ASC
                    "#,
                )
                .bind(SummaryStatus::Completed.to_string())
                .fetch_all(self.db.pool())
                .await?;
                (total as usize, lru)
            }
            None => (0, Vec::new()),
        };

        let victims = cache::select_victims(idle, lru, total, policy.max_entries);
        if dry_run || victims.is_empty() {
            return Ok(victims.len() as u64);
        }

        let mut tx = self.db.pool().begin().await?;
        let mut removed = 0;
        for id in &victims {
            removed += sqlx::query("DELETE FROM summaries WHERE summary_id = ? AND status = ?")
                .bind(id)
                .bind(SummaryStatus::Completed.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        info!(removed, "Evicted completed jobs");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<JobDbStats> {
        self.db.stats().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde_json::json;

    pub fn fox_spec(params: Value) -> JobSpec {
        JobSpec::new("The quick brown fox.", "t5-large", &params, "en", true).unwrap()
    }

    pub fn default_spec() -> JobSpec {
        fox_spec(json!({"relative_max_length": 0.4}))
    }

    /// Drive a job forward to `target` with placeholder payloads
    pub async fn advance_to(registry: &JobRegistry, job_id: &str, target: SummaryStatus) {
        let mut status = registry.get(job_id).await.unwrap().unwrap().get_status().unwrap();
        while status < target {
            let next = status.next().unwrap();
            let partial = if next.is_terminal() {
                Partial {
                    summary: Some("a fox.".to_string()),
                    ..Default::default()
                }
            } else {
                Partial {
                    stage_payload: Some(json!({"stage": next.to_string()})),
                    ..Default::default()
                }
            };
            registry.advance(job_id, next, partial).await.unwrap();
            status = next;
        }
    }
}
