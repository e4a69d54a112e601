//! TriggerBus in-memory implementation.
//!
//! A per-topic queue with competing-consumer semantics. Delivery is
//! unordered with respect to the store and may be duplicated: the bus can
//! be configured to enqueue N copies of every publish, which is how tests
//! exercise redelivery without a real broker.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use reliefmesh_core::bus::{BusError, Topic, Trigger, TriggerBus, TriggerStream};

struct TopicQueue {
    triggers: Mutex<VecDeque<Trigger>>,
    notify: Notify,
}

impl TopicQueue {
    fn new() -> Self {
        Self {
            triggers: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, trigger: Trigger) -> Result<(), BusError> {
        self.triggers
            .lock()
            .map_err(|e| BusError::Internal(e.to_string()))?
            .push_back(trigger);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Result<Option<Trigger>, BusError> {
        let mut triggers = self
            .triggers
            .lock()
            .map_err(|e| BusError::Internal(e.to_string()))?;
        let trigger = triggers.pop_front();
        // Hand the wakeup on when messages remain, so a second consumer
        // parked between its empty check and `notified` is not starved.
        if !triggers.is_empty() {
            self.notify.notify_one();
        }
        Ok(trigger)
    }

    fn len(&self) -> usize {
        self.triggers.lock().map(|q| q.len()).unwrap_or(0)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// In-process TriggerBus for development and testing.
pub struct InMemoryTriggerBus {
    topics: Mutex<HashMap<Topic, Arc<TopicQueue>>>,
    delivery_copies: usize,
}

impl InMemoryTriggerBus {
    /// Create a bus with normal (single-copy) delivery.
    pub fn new() -> Self {
        Self::with_delivery_copies(1)
    }

    /// Create a bus that enqueues every publish `copies` times, simulating
    /// broker redelivery.
    pub fn with_delivery_copies(copies: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            delivery_copies: copies.max(1),
        }
    }

    /// Number of triggers currently queued on a topic.
    pub fn queued(&self, topic: Topic) -> usize {
        self.topic_queue(topic).map(|q| q.len()).unwrap_or(0)
    }

    fn topic_queue(&self, topic: Topic) -> Result<Arc<TopicQueue>, BusError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|e| BusError::Internal(e.to_string()))?;
        Ok(topics
            .entry(topic)
            .or_insert_with(|| Arc::new(TopicQueue::new()))
            .clone())
    }
}

impl Default for InMemoryTriggerBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriggerBus for InMemoryTriggerBus {
    async fn publish(&self, topic: Topic, trigger: Trigger) -> Result<(), BusError> {
        let queue = self.topic_queue(topic)?;
        for _ in 0..self.delivery_copies {
            queue.push(trigger.clone())?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn TriggerStream>, BusError> {
        Ok(Box::new(InMemoryTriggerStream {
            queue: self.topic_queue(topic)?,
        }))
    }
}

struct InMemoryTriggerStream {
    queue: Arc<TopicQueue>,
}

#[async_trait]
impl TriggerStream for InMemoryTriggerStream {
    async fn recv(&mut self) -> Result<Option<Trigger>, BusError> {
        loop {
            if let Some(trigger) = self.queue.pop()? {
                return Ok(Some(trigger));
            }
            self.queue.notified().await;
        }
    }
}
