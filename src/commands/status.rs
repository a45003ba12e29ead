//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::meta::{FileDb, FileDbStats, JobDb, JobDbStats, Language, Model};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub jobs_db_path: String,
    pub files_db_path: String,
    pub stage_deadline_secs: Option<u64>,
    pub jobs: JobDbStats,
    pub files: FileDbStats,
    pub languages: Vec<Language>,
    pub models: Vec<Model>,
}

/// Get system status
pub async fn cmd_status(config: &Config, jobs: &JobDb, files: &FileDb) -> Result<StatusInfo> {
    info!("Getting status");

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        jobs_db_path: config.paths.jobs_db.display().to_string(),
        files_db_path: config.paths.files_db.display().to_string(),
        stage_deadline_secs: config.dispatcher.stage_deadline_secs,
        jobs: jobs.stats().await?,
        files: files.stats().await?,
        languages: jobs.list_languages().await?,
        models: jobs.list_models().await?,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 precis Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Jobs database: {}", status.jobs_db_path);
    println!("Files database: {}", status.files_db_path);
    match status.stage_deadline_secs {
        Some(secs) => println!("Stage deadline: {}s", secs),
        None => println!("Stage deadline: none"),
    }

    println!("\nJobs:");
    println!("  Sources: {}", status.jobs.source_count);
    println!("  Summaries: {}", status.jobs.summary_count);
    for (state, count) in &status.jobs.summaries_by_status {
        println!("    {}: {}", state, count);
    }
    println!("  Pre-processing cache entries: {}", status.jobs.preprocess_entries);
    println!("  Requests served: {}", status.jobs.total_requests);

    println!("\nFiles:");
    println!("  File ids: {}", status.files.file_count);
    println!(
        "  Distinct contents: {} ({} bytes)",
        status.files.content_count, status.files.content_bytes
    );

    println!("\nLanguages:");
    for language in &status.languages {
        println!("  {} ({})", language.language_tag, language.name);
    }

    println!("\nModels:");
    for model in &status.models {
        let tasks: Vec<String> = model.tasks.iter().map(|t| t.to_string()).collect();
        println!(
            "  {} [{} / {}] {}",
            model.name,
            model.vendor,
            model.family,
            tasks.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::testing::setup_dbs;

    #[tokio::test]
    async fn test_status_on_empty_databases() {
        let (jobs, files, config, _tmp) = setup_dbs().await;
        let status = cmd_status(&config, &jobs, &files).await.unwrap();

        assert_eq!(status.jobs.summary_count, 0);
        assert_eq!(status.files.content_bytes, 0);
        assert_eq!(status.languages.len(), config.reference.languages.len());
        assert_eq!(status.models.len(), config.reference.models.len());
    }
}
