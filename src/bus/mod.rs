//! Message bus
//!
//! Work for each pipeline stage goes out on that stage's topic, and stage
//! completions come back on the dispatcher topic. Delivery is assumed to be
//! at least once and unordered across jobs: a consumer acks a delivery once
//! handled and nacks it to have it redelivered.

mod memory;

pub use memory::*;

use crate::error::{Error, Result};
use crate::registry::{Stage, Warnings};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Topic names
pub mod topics {
    pub const PREPROCESSING: &str = "text-preprocessing";
    pub const ENCODING: &str = "text-encoding";
    pub const SUMMARIZATION: &str = "text-summarization";
    pub const POSTPROCESSING: &str = "text-postprocessing";
    /// Stage completions, consumed by the dispatcher
    pub const DISPATCHER: &str = "dispatcher";
}

impl Stage {
    /// Topic the stage's workers consume
    pub fn topic(self) -> &'static str {
        match self {
            Stage::Preprocessing => topics::PREPROCESSING,
            Stage::Encoding => topics::ENCODING,
            Stage::Summarizing => topics::SUMMARIZATION,
            Stage::Postprocessing => topics::POSTPROCESSING,
        }
    }
}

/// Work published to a stage's topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWork {
    pub job_id: String,
    pub stage: Stage,
    /// Stage input: source text for pre-processing, the previous stage's
    /// output otherwise
    pub input: Value,
    pub model: String,
    pub params: Value,
    pub language: String,
}

/// A stage's result, published to the dispatcher topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCompletion {
    pub job_id: String,
    pub stage: Stage,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Warnings>,
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
}

impl Delivery {
    /// Decode a JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Transport seam for the message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message, returning once the bus has accepted it
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Wait up to `timeout` for the next message on `topic`
    async fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>>;

    /// Mark a delivery as handled
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivery to its topic for redelivery once `delay` has passed
    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()>;
}

/// Serialize `message` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    key: &str,
    message: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    bus.publish(topic, key, payload)
        .await
        .map_err(|e| match e {
            Error::Bus(_) => e,
            other => Error::Bus(format!("publish to '{}' failed: {}", topic, other)),
        })
}
