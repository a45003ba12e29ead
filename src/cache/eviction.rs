//! Eviction pass over both databases

use super::{EvictionPolicy, FileCache, PreprocessCache};
use crate::content::{ContentStore, FileContentStore, SourceStore};
use crate::error::Result;
use crate::meta::{FileDb, JobDb};
use crate::registry::JobRegistry;
use serde::{Deserialize, Serialize};
use tracing::info;

/// What one eviction pass removed (or would remove, on a dry run)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionStats {
    pub preprocess_entries: u64,
    pub jobs: u64,
    pub sources: u64,
    pub file_entries: u64,
    pub file_contents: u64,
}

impl EvictionStats {
    pub fn total(&self) -> u64 {
        self.preprocess_entries + self.jobs + self.sources + self.file_entries + self.file_contents
    }
}

/// Applies eviction policies to every cache layer, then collects content
/// nothing references any more.
///
/// A dry run counts each step against the current state, so content that
/// would only become unreferenced after the earlier steps is not counted.
#[derive(Clone)]
pub struct Evictor {
    preprocess: PreprocessCache,
    registry: JobRegistry,
    sources: SourceStore,
    files: FileCache,
    file_contents: FileContentStore,
    job_policy: EvictionPolicy,
    file_policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(
        jobs: JobDb,
        files: FileDb,
        job_policy: EvictionPolicy,
        file_policy: EvictionPolicy,
    ) -> Self {
        Self {
            preprocess: PreprocessCache::new(jobs.clone()),
            registry: JobRegistry::new(jobs.clone()),
            sources: SourceStore::new(jobs),
            files: FileCache::new(files.clone()),
            file_contents: FileContentStore::new(files),
            job_policy,
            file_policy,
        }
    }

    pub async fn run(&self, dry_run: bool) -> Result<EvictionStats> {
        let stats = EvictionStats {
            preprocess_entries: self.preprocess.evict(&self.job_policy, dry_run).await?,
            jobs: self.registry.evict(&self.job_policy, dry_run).await?,
            sources: self.sources.collect_garbage(dry_run).await?,
            file_entries: self.files.evict(&self.file_policy, dry_run).await?,
            file_contents: self.file_contents.collect_garbage(dry_run).await?,
        };

        if stats.total() > 0 {
            info!(
                dry_run,
                preprocess_entries = stats.preprocess_entries,
                jobs = stats.jobs,
                sources = stats.sources,
                file_entries = stats.file_entries,
                file_contents = stats.file_contents,
                "Eviction pass finished"
            );
        }
        Ok(stats)
    }
}
