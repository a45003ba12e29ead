//! End-to-end runs of the dispatcher against loopback stage workers

use super::testing::*;
use super::CompletionOutcome;
use crate::bus::{publish_json, topics, MemoryBus, MessageBus, StageCompletion, StageWork};
use crate::registry::{Stage, SummaryStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const STAGES: [Stage; 4] = [
    Stage::Preprocessing,
    Stage::Encoding,
    Stage::Summarizing,
    Stage::Postprocessing,
];

async fn pipeline() -> Harness {
    harness_with(|c| c.dispatcher.poll_interval_ms = 10).await
}

fn stage_output(work: &StageWork) -> Value {
    match work.stage {
        Stage::Preprocessing => json!(work.input.as_str().unwrap_or_default().to_lowercase()),
        Stage::Encoding => json!([101, 1996, 4248, 2829, 4419, 102]),
        Stage::Summarizing => json!([1037, 4419]),
        Stage::Postprocessing => json!("a fox."),
    }
}

/// Runs every stage in-process, recording the work it handled
fn spawn_workers(
    bus: Arc<MemoryBus>,
    handled: Arc<Mutex<Vec<StageWork>>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !*shutdown.borrow_and_update() {
            for stage in STAGES {
                let Some(delivery) = bus.poll(stage.topic(), Duration::from_millis(5)).await.unwrap()
                else {
                    continue;
                };
                let work: StageWork = delivery.decode().unwrap();
                handled.lock().await.push(work.clone());
                let completion = StageCompletion {
                    job_id: work.job_id.clone(),
                    stage,
                    output: stage_output(&work),
                    warnings: None,
                };
                publish_json(bus.as_ref(), topics::DISPATCHER, &work.job_id, &completion)
                    .await
                    .unwrap();
                bus.ack(&delivery).await.unwrap();
            }
        }
    })
}

struct Running {
    handled: Arc<Mutex<Vec<StageWork>>>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn handled_for(&self, stage: Stage) -> Vec<StageWork> {
        let handled = self.handled.lock().await;
        handled.iter().filter(|w| w.stage == stage).cloned().collect()
    }

    async fn stop(self) {
        self.stop.send(true).unwrap();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn start(h: &Harness) -> Running {
    let (stop, rx) = watch::channel(false);
    let handled = Arc::new(Mutex::new(Vec::new()));

    let workers = spawn_workers(h.bus.clone(), handled.clone(), rx.clone());
    let dispatcher = h.dispatcher.clone();
    let consumer = tokio::spawn(async move {
        dispatcher.run(rx).await.unwrap();
    });

    Running {
        handled,
        stop,
        tasks: vec![workers, consumer],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_start_one_pipeline_run() {
    let h = pipeline().await;
    let replica = h.replica().await;

    let (a, b) = tokio::join!(
        h.dispatcher.submit(fox_request(json!({}))),
        replica.submit(fox_request(json!({}))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.summary_id, b.summary_id);
    assert_eq!(a.request_count.max(b.request_count), 2);
    assert_eq!(h.bus.pending(topics::PREPROCESSING).await, 1);
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let h = pipeline().await;
    let running = start(&h);

    let job = h.dispatcher.submit(default_request()).await.unwrap();
    let done = h
        .dispatcher
        .wait_for(&job.summary_id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(done.status, SummaryStatus::Completed);
    assert_eq!(done.output.as_deref(), Some("a fox."));
    let ended_at = done.ended_at.clone().unwrap();
    assert!(ended_at >= done.started_at);
    assert_eq!(done.request_count, 2);

    let again = h.dispatcher.get_summary(&job.summary_id).await.unwrap();
    assert_eq!(again.output.as_deref(), Some("a fox."));
    assert_eq!(again.request_count, 3);

    running.stop().await;
}

#[tokio::test]
async fn test_preprocessing_is_reused_across_params() {
    let h = pipeline().await;
    let running = start(&h);

    let first = h.dispatcher.submit(default_request()).await.unwrap();
    h.dispatcher
        .wait_for(&first.summary_id, Duration::from_secs(10))
        .await
        .unwrap();

    let second = h
        .dispatcher
        .submit(fox_request(json!({"relative_max_length": 0.2})))
        .await
        .unwrap();
    assert_ne!(second.summary_id, first.summary_id);
    assert_eq!(second.status, SummaryStatus::Encoding);

    let done = h
        .dispatcher
        .wait_for(&second.summary_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(done.status, SummaryStatus::Completed);

    assert_eq!(running.handled_for(Stage::Preprocessing).await.len(), 1);
    let encoded = running.handled_for(Stage::Encoding).await;
    assert_eq!(encoded.len(), 2);
    assert_eq!(encoded[1].job_id, second.summary_id);
    assert_eq!(encoded[1].input, json!("the quick brown fox."));
    assert_eq!(encoded[1].params, json!({"relative_max_length": 0.2}));

    running.stop().await;
}

#[tokio::test]
async fn test_differently_cased_sources_share_one_run() {
    let h = pipeline().await;
    let running = start(&h);

    let first = h.dispatcher.submit(default_request()).await.unwrap();
    h.dispatcher
        .wait_for(&first.summary_id, Duration::from_secs(10))
        .await
        .unwrap();

    let mut shouted = default_request();
    shouted.source = "THE QUICK BROWN FOX.".to_string();
    let second = h.dispatcher.submit(shouted).await.unwrap();
    assert_ne!(second.summary_id, first.summary_id);

    let done = h
        .dispatcher
        .wait_for(&second.summary_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(done.output.as_deref(), Some("a fox."));

    assert_eq!(running.handled_for(Stage::Preprocessing).await.len(), 2);
    assert_eq!(running.handled_for(Stage::Encoding).await.len(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_redelivered_completion_is_acknowledged() {
    let h = pipeline().await;
    let job = h.dispatcher.submit(fox_request(json!({}))).await.unwrap();
    let bus: &dyn MessageBus = h.bus.as_ref();

    let preprocessed = StageCompletion {
        job_id: job.summary_id.clone(),
        stage: Stage::Preprocessing,
        output: json!("the quick brown fox."),
        warnings: None,
    };
    let encoded = StageCompletion {
        job_id: job.summary_id.clone(),
        stage: Stage::Encoding,
        output: json!([101, 102]),
        warnings: None,
    };

    for completion in [&preprocessed, &encoded, &encoded] {
        publish_json(bus, topics::DISPATCHER, &job.summary_id, completion)
            .await
            .unwrap();
        let delivery = bus
            .poll(topics::DISPATCHER, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        h.dispatcher.process_delivery(delivery).await.unwrap();
    }

    assert_eq!(h.bus.pending(topics::DISPATCHER).await, 0);
    assert_eq!(h.bus.in_flight(topics::DISPATCHER).await, 0);
    assert_eq!(h.bus.pending(topics::SUMMARIZATION).await, 1);

    let state = h.dispatcher.get_summary(&job.summary_id).await.unwrap();
    assert_eq!(state.status, SummaryStatus::Summarizing);

    let outcome = h.dispatcher.handle_completion(&encoded).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Stale);
}

#[tokio::test]
async fn test_resumed_stage_does_not_move_job() {
    let h = pipeline().await;
    let job = h.dispatcher.submit(fox_request(json!({}))).await.unwrap();

    let preprocessed = StageCompletion {
        job_id: job.summary_id.clone(),
        stage: Stage::Preprocessing,
        output: json!("the quick brown fox."),
        warnings: None,
    };
    let first = h.dispatcher.handle_completion(&preprocessed).await.unwrap();
    assert_eq!(first, CompletionOutcome::Advanced(SummaryStatus::Encoding));

    // An operator re-publishing the current stage must not move the job
    let stage = h.dispatcher.resume(&job.summary_id).await.unwrap();
    assert_eq!(stage, Stage::Encoding);
    assert_eq!(h.bus.pending(topics::ENCODING).await, 2);

    let encoded = StageCompletion {
        job_id: job.summary_id.clone(),
        stage: Stage::Encoding,
        output: json!([101, 102]),
        warnings: None,
    };
    assert_eq!(
        h.dispatcher.handle_completion(&encoded).await.unwrap(),
        CompletionOutcome::Advanced(SummaryStatus::Summarizing)
    );
    assert_eq!(
        h.dispatcher.handle_completion(&encoded).await.unwrap(),
        CompletionOutcome::Stale
    );
    assert_eq!(h.bus.pending(topics::SUMMARIZATION).await, 1);
}
