//! Stage-completion handling and the dispatcher's background loops

use super::Dispatcher;
use crate::bus::{topics, Delivery, StageCompletion};
use crate::cache::EvictionStats;
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::registry::{AdvanceOutcome, Partial, Stage, SummaryStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a completion event did to its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The job moved to this status
    Advanced(SummaryStatus),
    /// Redelivery of the final result; nothing changed
    Duplicate,
    /// The job is already past this stage; nothing changed
    Stale,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub eviction: EvictionStats,
    pub stalled: Vec<String>,
}

fn text_output(completion: &StageCompletion) -> Result<String> {
    match &completion.output {
        Value::String(text) => fingerprint::normalize_text(text),
        other => Err(Error::Validation(format!(
            "{} output for job {} must be text, got {}",
            completion.stage, completion.job_id, other
        ))),
    }
}

impl Dispatcher {
    /// Apply a stage-completion event.
    ///
    /// Redelivered and out-of-date events are reported as
    /// [`CompletionOutcome::Stale`] or [`CompletionOutcome::Duplicate`], never
    /// as errors. An event for a stage the job has not reached yet is a
    /// [`Error::Conflict`], so the bus can redeliver it later.
    pub async fn handle_completion(&self, completion: &StageCompletion) -> Result<CompletionOutcome> {
        let job = self.require(&completion.job_id).await?;
        let current = job.get_status()?;
        let stage_status = completion.stage.status();

        if current > stage_status {
            if current.is_terminal() && completion.stage == Stage::Postprocessing {
                let summary = text_output(completion)?;
                let partial = Partial {
                    summary: Some(summary),
                    ..Default::default()
                };
                return match self
                    .registry
                    .advance(&job.summary_id, SummaryStatus::Completed, partial)
                    .await
                {
                    Ok(_) => Ok(CompletionOutcome::Duplicate),
                    Err(Error::Conflict(detail)) => {
                        warn!(summary_id = %job.summary_id, %detail, "Ignoring conflicting final result");
                        Ok(CompletionOutcome::Stale)
                    }
                    Err(e) => Err(e),
                };
            }
            debug!(
                summary_id = %job.summary_id,
                stage = %completion.stage,
                status = %current,
                "Stale completion"
            );
            return Ok(CompletionOutcome::Stale);
        }

        if current < stage_status {
            return Err(Error::Conflict(format!(
                "job {} is {}, not yet at {}",
                job.summary_id, current, completion.stage
            )));
        }

        let target = completion.stage.completes_into();
        let outcome = match completion.stage {
            Stage::Preprocessing => {
                let text = text_output(completion)?;
                self.complete_preprocessing(&job, &text, completion.warnings.clone())
                    .await
            }
            Stage::Encoding | Stage::Summarizing => {
                if completion.output.is_null() {
                    return Err(Error::Validation(format!(
                        "{} output for job {} is empty",
                        completion.stage, completion.job_id
                    )));
                }
                if let Some(next) = target.stage() {
                    self.publish_work(&job, next, completion.output.clone()).await?;
                }
                self.registry
                    .advance(
                        &job.summary_id,
                        target,
                        Partial {
                            stage_payload: Some(completion.output.clone()),
                            warnings: completion.warnings.clone(),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|advanced| (target, advanced))
            }
            Stage::Postprocessing => {
                let summary = text_output(completion)?;
                self.registry
                    .advance(
                        &job.summary_id,
                        target,
                        Partial {
                            summary: Some(summary),
                            warnings: completion.warnings.clone(),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|advanced| (target, advanced))
            }
        };

        match outcome {
            Ok((status, AdvanceOutcome::Advanced)) => Ok(CompletionOutcome::Advanced(status)),
            Ok((_, AdvanceOutcome::Unchanged)) => Ok(CompletionOutcome::Duplicate),
            Err(Error::StaleDelivery { job_id, detail }) => {
                debug!(summary_id = %job_id, %detail, "Completion raced with another delivery");
                Ok(CompletionOutcome::Stale)
            }
            Err(e) => Err(e),
        }
    }

    /// Decode and apply one delivery from the completions topic, then ack
    /// or nack it.
    ///
    /// Only malformed messages and [non-retryable](Error::is_retryable)
    /// faults are logged and acked. Every other failure is nacked with a
    /// growing delay until `max_delivery_attempts` (if set) is reached.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let completion: StageCompletion = match delivery.decode() {
            Ok(completion) => completion,
            Err(e) => {
                error!(key = %delivery.key, error = %e, "Dropping malformed completion");
                return self.bus.ack(&delivery).await;
            }
        };

        match self.handle_completion(&completion).await {
            Ok(outcome) => {
                debug!(summary_id = %completion.job_id, stage = %completion.stage, ?outcome, "Handled completion");
                self.bus.ack(&delivery).await
            }
            Err(e) if e.is_retryable() => {
                if let Some(max) = self.settings.max_delivery_attempts {
                    if delivery.attempt >= max {
                        error!(
                            summary_id = %completion.job_id,
                            stage = %completion.stage,
                            attempt = delivery.attempt,
                            error = %e,
                            "Giving up on completion"
                        );
                        return self.bus.ack(&delivery).await;
                    }
                }
                let delay = self.settings.redelivery_delay(delivery.attempt);
                warn!(
                    summary_id = %completion.job_id,
                    stage = %completion.stage,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Completion failed, requesting redelivery"
                );
                self.bus.nack(delivery, delay).await
            }
            Err(e) => {
                error!(
                    summary_id = %completion.job_id,
                    stage = %completion.stage,
                    error = %e,
                    "Dropping completion that cannot be applied"
                );
                self.bus.ack(&delivery).await
            }
        }
    }

    /// Evict under the configured policies and report stalled jobs
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let eviction = self.evictor.run(false).await?;

        let stalled = self.stalled_jobs().await?;
        for job in &stalled {
            warn!(
                summary_id = %job.summary_id,
                status = %job.status,
                since = %job.status_changed_at,
                "Job stalled"
            );
        }

        Ok(MaintenanceReport {
            eviction,
            stalled: stalled.into_iter().map(|j| j.summary_id).collect(),
        })
    }

    /// Consume completions and run periodic maintenance until `shutdown`
    /// turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(instance = %self.instance_id, "Dispatcher running");

        let maintenance = tokio::spawn({
            let this = self.clone();
            let shutdown = shutdown.clone();
            async move { this.maintenance_loop(shutdown).await }
        });

        let poll_interval = self.settings.poll_interval();
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                polled = self.bus.poll(topics::DISPATCHER, poll_interval) => {
                    match polled {
                        Ok(Some(delivery)) => {
                            if let Err(e) = self.process_delivery(delivery).await {
                                error!(error = %e, "Failed to settle delivery");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "Polling completions failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        }

        if let Err(e) = maintenance.await {
            error!(error = %e, "Maintenance task failed");
        }
        info!(instance = %self.instance_id, "Dispatcher stopped");
        Ok(())
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.maintenance_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.maintain().await {
                        Ok(report) => debug!(
                            evicted = report.eviction.total(),
                            stalled = report.stalled.len(),
                            "Maintenance pass finished"
                        ),
                        Err(e) => warn!(error = %e, "Maintenance pass failed"),
                    }
                }
            }
        }
    }
}
