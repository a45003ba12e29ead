//! Evict command implementation

use crate::cache::{EvictionPolicy, EvictionStats, Evictor};
use crate::config::Config;
use crate::error::Result;
use crate::meta::{FileDb, JobDb};
use tracing::info;

/// Threshold overrides from the command line
#[derive(Debug, Clone, Default)]
pub struct EvictOptions {
    pub dry_run: bool,
    pub uncached_idle_secs: Option<u64>,
    pub max_jobs: Option<usize>,
    pub max_files: Option<usize>,
}

fn override_policy(
    mut policy: EvictionPolicy,
    idle_secs: Option<u64>,
    max_entries: Option<usize>,
) -> EvictionPolicy {
    if let Some(secs) = idle_secs {
        policy.uncached_idle = Some(std::time::Duration::from_secs(secs));
    }
    if let Some(max) = max_entries {
        policy.max_entries = Some(max);
    }
    policy
}

/// Run one eviction pass with the configured policies, optionally overridden
pub async fn cmd_evict(
    config: &Config,
    jobs: &JobDb,
    files: &FileDb,
    options: EvictOptions,
) -> Result<EvictionStats> {
    let job_policy = override_policy(
        config.cache.policy(),
        options.uncached_idle_secs,
        options.max_jobs,
    );
    let file_policy = override_policy(
        config.files.policy(),
        options.uncached_idle_secs,
        options.max_files,
    );
    info!(dry_run = options.dry_run, ?job_policy, ?file_policy, "Evicting");

    let evictor = Evictor::new(jobs.clone(), files.clone(), job_policy, file_policy);
    evictor.run(options.dry_run).await
}

/// Print eviction stats to console
pub fn print_eviction_stats(stats: &EvictionStats, dry_run: bool) {
    if dry_run {
        println!("\n🔍 Eviction preview (dry run)\n");
    } else {
        println!("\n🧹 Eviction complete\n");
    }

    println!("  Pre-processing cache entries: {}", stats.preprocess_entries);
    println!("  Jobs: {}", stats.jobs);
    println!("  Sources: {}", stats.sources);
    println!("  File ids: {}", stats.file_entries);
    println!("  File contents: {}", stats.file_contents);

    if stats.total() == 0 {
        println!("\nNothing to evict.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::testing::setup_dbs;
    use crate::registry::testing::{advance_to, fox_spec};
    use crate::registry::{JobRegistry, SummaryStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_max_jobs_override() {
        let (jobs, files, config, _tmp) = setup_dbs().await;
        let registry = JobRegistry::new(jobs.clone());
        for beams in 1..=3 {
            let (job, _) = registry.get_or_create(&fox_spec(json!({"num_beams": beams}))).await.unwrap();
            advance_to(&registry, &job.summary_id, SummaryStatus::Completed).await;
        }

        let none = cmd_evict(&config, &jobs, &files, EvictOptions::default()).await.unwrap();
        assert_eq!(none.total(), 0);

        let options = EvictOptions {
            dry_run: true,
            max_jobs: Some(1),
            ..Default::default()
        };
        let preview = cmd_evict(&config, &jobs, &files, options.clone()).await.unwrap();
        assert_eq!(preview.jobs, 2);
        assert_eq!(registry.list(&Default::default()).await.unwrap().len(), 3);

        let stats = cmd_evict(
            &config,
            &jobs,
            &files,
            EvictOptions {
                dry_run: false,
                ..options
            },
        )
        .await
        .unwrap();
        assert_eq!(stats.jobs, 2);
        assert_eq!(registry.list(&Default::default()).await.unwrap().len(), 1);
    }
}
