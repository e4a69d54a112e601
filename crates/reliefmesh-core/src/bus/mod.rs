//! Trigger bus abstraction
//!
//! Asynchronous stage triggering with at-least-once semantics: `publish`
//! returns once the message is durably enqueued, not once consumed, and a
//! message may be delivered more than once and out of order. Subscribers on
//! the same topic compete for messages (queue semantics, not fan-out);
//! idempotency is the consumer's job, via the claim primitive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::RequestId;

/// Bus error types
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The two trigger topics of the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    DamageAnalysis,
    Logistics,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::DamageAnalysis, Topic::Logistics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DamageAnalysis => "damage-analysis-trigger",
            Topic::Logistics => "logistics-trigger",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trigger message advancing one request to the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub request_id: RequestId,
    /// Requeue counter; 0 on first publish.
    #[serde(default)]
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(request_id: impl Into<RequestId>) -> Self {
        Self {
            request_id: request_id.into(),
            attempt: 0,
            published_at: Utc::now(),
        }
    }

    /// Build the requeued copy of this trigger.
    pub fn retry(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            attempt: self.attempt + 1,
            published_at: Utc::now(),
        }
    }
}

/// A competing-consumer handle on one topic.
#[async_trait]
pub trait TriggerStream: Send {
    /// Receive the next trigger; `None` when the bus shut down.
    async fn recv(&mut self) -> Result<Option<Trigger>, BusError>;
}

/// TriggerBus trait - async interface for stage triggering.
#[async_trait]
pub trait TriggerBus: Send + Sync {
    /// Durably enqueue a trigger on a topic.
    async fn publish(&self, topic: Topic, trigger: Trigger) -> Result<(), BusError>;

    /// Open a competing-consumer subscription on a topic.
    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn TriggerStream>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_increments_attempt_and_keeps_id() {
        let trigger = Trigger::new("req-1");
        assert_eq!(trigger.attempt, 0);
        let requeued = trigger.retry();
        assert_eq!(requeued.attempt, 1);
        assert_eq!(requeued.request_id, trigger.request_id);
    }

    #[test]
    fn test_topic_names_are_stable() {
        assert_eq!(Topic::DamageAnalysis.as_str(), "damage-analysis-trigger");
        assert_eq!(Topic::Logistics.as_str(), "logistics-trigger");
    }
}
