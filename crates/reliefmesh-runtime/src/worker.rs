//! Stage consumption loop and publish retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

use reliefmesh_core::bus::{BusError, Topic, Trigger, TriggerBus};
use reliefmesh_core::store::StoreError;

/// Stage infrastructure errors.
///
/// Engine failures are deliberately absent: the workers record those into
/// the owning record instead of raising them.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Outcome of handling one trigger delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran to a complete record.
    Completed,
    /// The stage ran; the engine failed and the record is terminally failed.
    EngineFailed,
    /// A record for this request already existed; redelivery absorbed.
    Duplicate,
    /// Another worker won the claim race; absorbed.
    LostClaim,
    /// A dependency is not visible yet; the trigger was requeued.
    Requeued,
    /// The dependency can never be satisfied; terminal failure recorded.
    PreconditionFailed,
    /// Requeue budget exhausted with no record to fail into; delivery dropped.
    Dropped,
}

/// A stage worker's entry point, invoked once per delivered trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Stage name used in logs.
    fn stage(&self) -> &'static str;

    async fn handle(&self, trigger: Trigger) -> Result<StageOutcome, StageError>;
}

/// Publish with bounded exponential backoff.
///
/// Used after a store write succeeded: the write is never rolled back, so
/// exhausting the budget leaves a detectable stuck state for external
/// reconciliation rather than a silent failure.
pub async fn publish_with_retry(
    bus: &dyn TriggerBus,
    topic: Topic,
    trigger: Trigger,
    attempts: u32,
    base_backoff: Duration,
) -> Result<(), BusError> {
    let mut delay = base_backoff;
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
        match bus.publish(topic, trigger.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    request_id = %trigger.request_id,
                    attempt,
                    error = %e,
                    "trigger publish failed"
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BusError::Publish("no publish attempt made".to_string())))
}

/// Requeue a trigger after a delay without blocking the consumer.
pub(crate) fn requeue_after(
    bus: Arc<dyn TriggerBus>,
    topic: Topic,
    trigger: Trigger,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = bus.publish(topic, trigger.clone()).await {
            tracing::error!(
                topic = %topic,
                request_id = %trigger.request_id,
                error = %e,
                "requeue publish failed; trigger lost to bus-level redelivery"
            );
        }
    });
}

/// Spawn `concurrency` competing consumers for one stage.
pub fn spawn_consumers(
    bus: Arc<dyn TriggerBus>,
    topic: Topic,
    handler: Arc<dyn TriggerHandler>,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|_| {
            let bus = bus.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                run_consumer(bus, topic, handler).await;
            })
        })
        .collect()
}

/// Consume one topic until the bus shuts down.
pub async fn run_consumer(bus: Arc<dyn TriggerBus>, topic: Topic, handler: Arc<dyn TriggerHandler>) {
    let mut stream = match bus.subscribe(topic).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "subscribe failed; consumer not started");
            return;
        }
    };

    loop {
        match stream.recv().await {
            Ok(Some(trigger)) => {
                let request_id = trigger.request_id.clone();
                match handler.handle(trigger).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            stage = handler.stage(),
                            request_id = %request_id,
                            ?outcome,
                            "trigger handled"
                        );
                    }
                    Err(e) => {
                        // Infrastructure fault mid-stage: no terminal status
                        // was written, so bus-level redelivery will retry and
                        // the claim guard keeps the retry safe.
                        tracing::error!(
                            stage = handler.stage(),
                            request_id = %request_id,
                            error = %e,
                            "stage handling failed; delivery left for redelivery"
                        );
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "trigger stream failed; consumer stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliefmesh_stores::InMemoryTriggerBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBus {
        failures_left: AtomicU32,
        inner: InMemoryTriggerBus,
    }

    #[async_trait]
    impl TriggerBus for FlakyBus {
        async fn publish(&self, topic: Topic, trigger: Trigger) -> Result<(), BusError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BusError::Publish("broker unavailable".to_string()));
            }
            self.inner.publish(topic, trigger).await
        }

        async fn subscribe(
            &self,
            topic: Topic,
        ) -> Result<Box<dyn reliefmesh_core::bus::TriggerStream>, BusError> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_retry_recovers_from_transient_failure() {
        let bus = FlakyBus {
            failures_left: AtomicU32::new(2),
            inner: InMemoryTriggerBus::new(),
        };

        publish_with_retry(
            &bus,
            Topic::DamageAnalysis,
            Trigger::new("req-1"),
            3,
            Duration::from_millis(10),
        )
        .await
        .expect("third attempt succeeds");

        assert_eq!(bus.inner.queued(Topic::DamageAnalysis), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_retry_exhausts_and_reports_last_error() {
        let bus = FlakyBus {
            failures_left: AtomicU32::new(10),
            inner: InMemoryTriggerBus::new(),
        };

        let err = publish_with_retry(
            &bus,
            Topic::Logistics,
            Trigger::new("req-1"),
            3,
            Duration::from_millis(10),
        )
        .await
        .expect_err("all attempts fail");

        assert!(matches!(err, BusError::Publish(_)));
        assert_eq!(bus.inner.queued(Topic::Logistics), 0);
    }
}
