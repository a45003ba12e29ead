//! Job inspection commands

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{JobFilter, JobRegistry, Summary, SummaryStatus, Warnings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// A job as shown to operators. Reading it does not count as a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub summary_id: String,
    pub status: SummaryStatus,
    pub source_id: String,
    pub model: String,
    pub language: String,
    pub params: Value,
    pub cache: bool,
    pub request_count: i64,
    pub started_at: String,
    pub status_changed_at: String,
    pub ended_at: Option<String>,
    pub last_accessed: String,
    pub summary_length: Option<i64>,
    pub summary: Option<String>,
    pub warnings: Warnings,
}

impl JobInfo {
    fn from_summary(job: Summary) -> Result<Self> {
        Ok(Self {
            status: job.get_status()?,
            params: job.get_params()?,
            warnings: job.get_warnings()?,
            summary_id: job.summary_id,
            source_id: job.source_id,
            model: job.model_name,
            language: job.language_tag,
            cache: job.cache,
            request_count: job.request_count,
            started_at: job.started_at,
            status_changed_at: job.status_changed_at,
            ended_at: job.ended_at,
            last_accessed: job.last_accessed,
            summary_length: job.summary_length,
            summary: job.summary,
        })
    }
}

fn to_infos(jobs: Vec<Summary>) -> Result<Vec<JobInfo>> {
    jobs.into_iter().map(JobInfo::from_summary).collect()
}

/// Show one job
pub async fn cmd_get_job(registry: &JobRegistry, job_id: &str) -> Result<JobInfo> {
    let job = registry
        .get(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
    JobInfo::from_summary(job)
}

/// List jobs, newest first
pub async fn cmd_list_jobs(registry: &JobRegistry, filter: &JobFilter) -> Result<Vec<JobInfo>> {
    info!(status = ?filter.status, limit = ?filter.limit, "Listing jobs");
    to_infos(registry.list(filter).await?)
}

/// Jobs stuck in one stage past the configured deadline
pub async fn cmd_stalled_jobs(config: &Config, registry: &JobRegistry) -> Result<Vec<JobInfo>> {
    let deadline = config.dispatcher.stage_deadline().ok_or_else(|| {
        Error::Config("dispatcher.stage_deadline_secs is not set".to_string())
    })?;
    to_infos(registry.stalled(deadline).await?)
}

/// Delete a completed job
pub async fn cmd_delete_job(registry: &JobRegistry, job_id: &str) -> Result<()> {
    registry.delete(job_id).await
}

/// Print one job in full
pub fn print_job(job: &JobInfo) {
    println!("\n📄 Job {}\n", job.summary_id);
    println!("Status: {}", job.status);
    println!("Model: {} ({})", job.model, job.language);
    println!("Params: {}", job.params);
    println!("Source: {}", job.source_id);
    println!("Cached: {}", if job.cache { "yes" } else { "no" });
    println!("Requests: {}", job.request_count);
    println!("Started: {}", job.started_at);
    println!("In current status since: {}", job.status_changed_at);
    if let Some(ended) = &job.ended_at {
        println!("Ended: {}", ended);
    }
    println!("Last accessed: {}", job.last_accessed);

    if !job.warnings.is_empty() {
        println!("\nWarnings:");
        for (field, messages) in &job.warnings {
            for message in messages {
                println!("  {}: {}", field, message);
            }
        }
    }

    if let Some(summary) = &job.summary {
        println!(
            "\nSummary ({} chars):\n{}",
            job.summary_length.unwrap_or_default(),
            summary
        );
    }
}

/// Print a job listing
pub fn print_jobs(jobs: &[JobInfo], empty_message: &str) {
    if jobs.is_empty() {
        println!("{}", empty_message);
        return;
    }

    for job in jobs {
        println!(
            "• {} [{}] {} / {}",
            job.summary_id, job.status, job.model, job.language
        );
        println!(
            "  Requests: {}, since: {}",
            job.request_count, job.status_changed_at
        );
    }
    println!("\n{} job(s)", jobs.len());
}
