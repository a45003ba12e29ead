//! Request dispatcher
//!
//! The dispatcher is the only writer of job and cache state and the only
//! publisher to stage topics. It keeps no job state in memory: every
//! decision is made against the databases, so any number of instances can
//! run side by side.
//!
//! Side effects are ordered so that a crash is recovered by redelivery:
//! the next stage's work is published *before* the job is advanced. If the
//! process dies in between, the completion event is redelivered, the work
//! is published again and the advance goes through.

mod events;
mod files;
#[cfg(test)]
mod pipeline;

pub use events::*;
pub use files::*;

use crate::bus::{publish_json, MessageBus, StageWork};
use crate::cache::{Evictor, FileCache, PreprocessCache};
use crate::config::{default_request_cache, Config, DispatcherConfig};
use crate::content::{ContentStore, FileContentStore, SourceStore};
use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::meta::{self, FileDb, JobDb};
use crate::registry::{
    AdvanceOutcome, JobRegistry, JobSpec, Partial, Stage, Summary, SummaryStatus, Warnings,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An inbound summarization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub source: String,
    pub model: String,
    #[serde(default)]
    pub params: Value,
    pub language: String,
    /// Keep the result around after it has been served
    #[serde(default = "default_request_cache")]
    pub cache: bool,
}

/// The state of a job as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub summary_id: String,
    pub status: SummaryStatus,
    /// Final summary, only once `completed`
    pub output: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub model: String,
    pub params: Value,
    pub language: String,
    pub request_count: i64,
    pub warnings: Warnings,
    /// The job has sat in its current stage past the configured deadline
    pub stalled: bool,
}

/// Orchestrates jobs through the pipeline
#[derive(Clone)]
pub struct Dispatcher {
    jobs: JobDb,
    registry: JobRegistry,
    sources: SourceStore,
    preprocess: PreprocessCache,
    files: FileCache,
    file_contents: FileContentStore,
    evictor: Evictor,
    bus: Arc<dyn MessageBus>,
    settings: DispatcherConfig,
    instance_id: Uuid,
}

impl Dispatcher {
    pub fn new(config: &Config, jobs: JobDb, files: FileDb, bus: Arc<dyn MessageBus>) -> Self {
        let instance_id = Uuid::new_v4();
        debug!(instance = %instance_id, "Creating dispatcher");
        Self {
            registry: JobRegistry::new(jobs.clone()),
            sources: SourceStore::new(jobs.clone()),
            preprocess: PreprocessCache::new(jobs.clone()),
            files: FileCache::new(files.clone()),
            file_contents: FileContentStore::new(files.clone()),
            evictor: Evictor::new(
                jobs.clone(),
                files,
                config.cache.policy(),
                config.files.policy(),
            ),
            jobs,
            bus,
            settings: config.dispatcher.clone(),
            instance_id,
        }
    }

    /// Open both databases, creating them if needed, and build a dispatcher
    pub async fn open(config: &Config, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let jobs = JobDb::open(config).await?;
        let files = FileDb::open(config).await?;
        Ok(Self::new(config, jobs, files, bus))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Accept a summarization request.
    ///
    /// Identical requests resolve to the same job and only the first one
    /// starts the pipeline. A job whose raw source was pre-processed before
    /// skips straight to encoding, or completes at once if that text was
    /// already summarized with the same model, params and language.
    pub async fn submit(&self, request: SummaryRequest) -> Result<SummaryResponse> {
        let spec = JobSpec::new(
            &request.source,
            &request.model,
            &request.params,
            &request.language,
            request.cache,
        )?;
        self.jobs
            .validate_summary_target(&spec.model, &spec.language)
            .await?;

        let (job, created) = self.registry.get_or_create(&spec).await?;
        if !created {
            debug!(
                summary_id = %spec.summary_id,
                status = %job.status,
                request_count = job.request_count,
                "Deduplicated request"
            );
            return self.respond(&job);
        }

        info!(summary_id = %spec.summary_id, model = %spec.model, "Created job");
        self.start(&job, &spec).await?;

        let job = self.require(spec.summary_id.as_str()).await?;
        self.respond(&job)
    }

    async fn start(&self, job: &Summary, spec: &JobSpec) -> Result<()> {
        match self.cached_preprocessing(&spec.source_id).await? {
            Some((text, warnings)) => {
                info!(summary_id = %spec.summary_id, "Reusing pre-processed source");
                let warnings = if warnings.is_empty() { None } else { Some(warnings) };
                self.complete_preprocessing(job, &text, warnings).await?;
            }
            None => {
                self.publish_work(job, Stage::Preprocessing, Value::String(spec.source.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Pre-processed text and warnings for a raw source, if a previous job
    /// produced them
    async fn cached_preprocessing(&self, raw_id: &Fingerprint) -> Result<Option<(String, Warnings)>> {
        let Some(entry) = self.preprocess.lookup(raw_id).await? else {
            return Ok(None);
        };

        let preprocessed_source = self
            .registry
            .get(&entry.preprocessed_id)
            .await?
            .and_then(|job| job.preprocessed_source_id);
        let Some(source_id) = preprocessed_source else {
            debug!(raw_id = %raw_id, "Cache entry not yet usable");
            return Ok(None);
        };

        let source_id: Fingerprint = source_id.parse()?;
        match self.sources.get(&source_id).await {
            Ok(text) => Ok(Some((text, entry.get_warnings()?))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply pre-processing output to a job and return the status it moved
    /// to.
    ///
    /// Records the cache entry first. If an equivalent job already completed
    /// from the same pre-processed text, its result is reused and nothing is
    /// published. Otherwise encoding work is published, then the job
    /// advances together with its pre-processed source.
    async fn complete_preprocessing(
        &self,
        job: &Summary,
        preprocessed: &str,
        warnings: Option<Warnings>,
    ) -> Result<(SummaryStatus, AdvanceOutcome)> {
        let text = fingerprint::normalize_text(preprocessed)?;

        let raw_id: Fingerprint = job.source_id.parse()?;
        self.preprocess
            .record(&raw_id, &job.summary_id, warnings.as_ref(), job.cache)
            .await?;

        let preprocessed_id = fingerprint::source_fingerprint(&text);
        if let Some(donor) = self.registry.find_completed(job, &preprocessed_id).await? {
            debug!(summary_id = %job.summary_id, donor = %donor.summary_id, "Pre-processed text already summarized");
            let partial = Partial {
                preprocessed_source: Some(text),
                warnings,
                ..Default::default()
            };
            let outcome = self
                .registry
                .complete_from(&job.summary_id, &donor, partial)
                .await?;
            return Ok((SummaryStatus::Completed, outcome));
        }

        let payload = Value::String(text.clone());
        self.publish_work(job, Stage::Encoding, payload.clone()).await?;

        let outcome = self
            .registry
            .advance(
                &job.summary_id,
                SummaryStatus::Encoding,
                Partial {
                    stage_payload: Some(payload),
                    preprocessed_source: Some(text),
                    warnings,
                    summary: None,
                },
            )
            .await?;
        Ok((SummaryStatus::Encoding, outcome))
    }

    async fn publish_work(&self, job: &Summary, stage: Stage, input: Value) -> Result<()> {
        let work = StageWork {
            job_id: job.summary_id.clone(),
            stage,
            input,
            model: job.model_name.clone(),
            params: job.get_params()?,
            language: job.language_tag.clone(),
        };
        publish_json(self.bus.as_ref(), stage.topic(), &job.summary_id, &work).await?;
        debug!(summary_id = %job.summary_id, stage = %stage, "Published stage work");
        Ok(())
    }

    /// Report a job's state. Serving a completed job counts as a request.
    pub async fn get_summary(&self, job_id: &str) -> Result<SummaryResponse> {
        let job = self.require(job_id).await?;
        if !job.get_status()?.is_terminal() {
            return self.respond(&job);
        }

        self.registry.touch(job_id).await?;
        let job = self.require(job_id).await?;
        self.respond(&job)
    }

    /// Wait until a job completes, checking every poll interval.
    ///
    /// Fails with [`Error::Timeout`] if the job is still in flight after
    /// `timeout`.
    pub async fn wait_for(&self, job_id: &str, timeout: Duration) -> Result<SummaryResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.require(job_id).await?;
            if job.get_status()?.is_terminal() {
                return self.get_summary(job_id).await;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let changed = meta::parse_timestamp(&job.status_changed_at)?;
                return Err(Error::Timeout {
                    job_id: job_id.to_string(),
                    stage: job.status.clone(),
                    elapsed_secs: (Utc::now() - changed).num_seconds(),
                });
            }
            let pause = self.settings.poll_interval().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Re-publish the current stage's work for an in-flight job.
    ///
    /// For operators recovering a stalled job; never called automatically.
    pub async fn resume(&self, job_id: &str) -> Result<Stage> {
        let job = self.require(job_id).await?;
        let status = job.get_status()?;
        let Some(stage) = status.stage() else {
            return Err(Error::Conflict(format!("job {} is already completed", job_id)));
        };

        let input = match stage {
            Stage::Preprocessing => {
                let source_id: Fingerprint = job.source_id.parse()?;
                Value::String(self.sources.get(&source_id).await?)
            }
            _ => job.get_stage_payload()?.ok_or_else(|| {
                Error::Conflict(format!("job {} has no stored input for {}", job_id, stage))
            })?,
        };

        self.publish_work(&job, stage, input).await?;
        warn!(summary_id = %job_id, stage = %stage, "Re-published stage work");
        Ok(stage)
    }

    /// In-flight jobs past the stage deadline. Empty if no deadline is set.
    pub async fn stalled_jobs(&self) -> Result<Vec<Summary>> {
        match self.settings.stage_deadline() {
            Some(deadline) => self.registry.stalled(deadline).await,
            None => Ok(Vec::new()),
        }
    }

    async fn require(&self, job_id: &str) -> Result<Summary> {
        self.registry
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    fn is_stalled(&self, job: &Summary, status: SummaryStatus) -> Result<bool> {
        let Some(deadline) = self.settings.stage_deadline() else {
            return Ok(false);
        };
        if status.is_terminal() {
            return Ok(false);
        }
        Ok(job.status_changed_at <= meta::cutoff(deadline)?)
    }

    fn respond(&self, job: &Summary) -> Result<SummaryResponse> {
        let status = job.get_status()?;
        Ok(SummaryResponse {
            summary_id: job.summary_id.clone(),
            status,
            output: if status.is_terminal() {
                job.summary.clone()
            } else {
                None
            },
            started_at: job.started_at.clone(),
            ended_at: job.ended_at.clone(),
            model: job.model_name.clone(),
            params: job.get_params()?,
            language: job.language_tag.clone(),
            request_count: job.request_count,
            warnings: job.get_warnings()?,
            stalled: self.is_stalled(job, status)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::meta::testing::setup_dbs;
    use serde_json::json;
    use tempfile::TempDir;

    pub struct Harness {
        pub dispatcher: Dispatcher,
        pub bus: Arc<MemoryBus>,
        pub jobs: JobDb,
        pub config: Config,
        pub _tmp: TempDir,
    }

    impl Harness {
        /// Another dispatcher instance over the same databases and bus
        pub async fn replica(&self) -> Dispatcher {
            Dispatcher::open(&self.config, self.bus.clone()).await.unwrap()
        }
    }

    pub async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    /// Redeliveries are immediate unless `configure` sets a delay
    pub async fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
        let (jobs, files, mut config, tmp) = setup_dbs().await;
        config.dispatcher.redelivery_delay_ms = 0;
        configure(&mut config);
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = Dispatcher::new(&config, jobs.clone(), files, bus.clone());
        Harness {
            dispatcher,
            bus,
            jobs,
            config,
            _tmp: tmp,
        }
    }

    pub fn fox_request(params: Value) -> SummaryRequest {
        SummaryRequest {
            source: "The quick brown fox.".to_string(),
            model: "t5-large".to_string(),
            params,
            language: "en".to_string(),
            cache: true,
        }
    }

    pub fn default_request() -> SummaryRequest {
        fox_request(json!({"relative_max_length": 0.4}))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::bus::topics;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_dedups_requests() {
        let h = harness().await;

        let first = h.dispatcher.submit(default_request()).await.unwrap();
        assert_eq!(first.status, SummaryStatus::Preprocessing);
        assert_eq!(first.request_count, 1);
        assert!(first.output.is_none());
        assert!(first.ended_at.is_none());
        assert_eq!(h.bus.pending(topics::PREPROCESSING).await, 1);

        let second = h.dispatcher.submit(default_request()).await.unwrap();
        assert_eq!(second.summary_id, first.summary_id);
        assert_eq!(second.request_count, 2);
        assert_eq!(second.status, SummaryStatus::Preprocessing);
        assert_eq!(h.bus.pending(topics::PREPROCESSING).await, 1);
    }

    #[tokio::test]
    async fn test_submit_key_order_does_not_matter() {
        let h = harness().await;
        let a = h
            .dispatcher
            .submit(fox_request(json!({"num_beams": 4, "relative_max_length": 0.4})))
            .await
            .unwrap();
        let b = h
            .dispatcher
            .submit(fox_request(json!({"relative_max_length": 0.4, "num_beams": 4.0})))
            .await
            .unwrap();
        assert_eq!(a.summary_id, b.summary_id);
        assert_eq!(b.request_count, 2);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let h = harness().await;

        let mut empty = default_request();
        empty.source = "   ".to_string();
        assert!(matches!(h.dispatcher.submit(empty).await, Err(Error::Validation(_))));

        let mut bad_params = default_request();
        bad_params.params = json!([1, 2]);
        assert!(matches!(h.dispatcher.submit(bad_params).await, Err(Error::Validation(_))));

        let mut bad_language = default_request();
        bad_language.language = "tlh".to_string();
        assert!(matches!(h.dispatcher.submit(bad_language).await, Err(Error::Validation(_))));

        let mut bad_model = default_request();
        bad_model.model = "unknown".to_string();
        assert!(matches!(h.dispatcher.submit(bad_model).await, Err(Error::Validation(_))));

        assert_eq!(h.bus.pending(topics::PREPROCESSING).await, 0);
    }

    #[tokio::test]
    async fn test_get_unknown_summary() {
        let h = harness().await;
        assert!(matches!(
            h.dispatcher.get_summary("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_in_flight_reads_do_not_count() {
        let h = harness().await;
        let created = h.dispatcher.submit(default_request()).await.unwrap();

        let read = h.dispatcher.get_summary(&created.summary_id).await.unwrap();
        assert_eq!(read.request_count, 1);
        assert!(read.output.is_none());
        assert!(!read.stalled);
    }

    #[tokio::test]
    async fn test_stalled_flag_and_resume() {
        let h = harness_with(|c| c.dispatcher.stage_deadline_secs = Some(1)).await;
        let created = h.dispatcher.submit(default_request()).await.unwrap();
        assert!(!created.stalled);
        assert!(h.dispatcher.stalled_jobs().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let read = h.dispatcher.get_summary(&created.summary_id).await.unwrap();
        assert!(read.stalled);
        assert_eq!(h.dispatcher.stalled_jobs().await.unwrap().len(), 1);

        let stage = h.dispatcher.resume(&created.summary_id).await.unwrap();
        assert_eq!(stage, Stage::Preprocessing);
        assert_eq!(h.bus.pending(topics::PREPROCESSING).await, 2);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let h = harness_with(|c| c.dispatcher.poll_interval_ms = 10).await;
        let created = h.dispatcher.submit(default_request()).await.unwrap();

        let result = h
            .dispatcher
            .wait_for(&created.summary_id, Duration::from_millis(50))
            .await;
        match result {
            Err(Error::Timeout { job_id, stage, .. }) => {
                assert_eq!(job_id, created.summary_id);
                assert_eq!(stage, "preprocessing");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
