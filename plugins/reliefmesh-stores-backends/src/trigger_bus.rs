//! Redis implementation of the TriggerBus.
//!
//! Each topic is a Redis list; `publish` is an LPUSH, consumers take with
//! BLMOVE into a per-topic processing list and acknowledge with LREM after
//! parsing. Triggers stranded in the processing list by a crashed consumer
//! are pushed back onto the queue by `recover_pending`, which is what makes
//! delivery at-least-once across restarts.

use async_trait::async_trait;
use redis::AsyncCommands;

use reliefmesh_core::bus::{BusError, Topic, Trigger, TriggerBus, TriggerStream};

const BLOCK_SECONDS: u64 = 1;

/// Redis-backed trigger bus with competing-consumer queue semantics.
pub struct RedisTriggerBus {
    client: redis::Client,
    key_prefix: String,
}

impl RedisTriggerBus {
    /// Create a new Redis trigger bus from a connection URL.
    pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<Self, BusError> {
        let client =
            redis::Client::open(connection_url).map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn queue_key(&self, topic: Topic) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }

    fn processing_key(&self, topic: Topic) -> String {
        format!("{}:{}:processing", self.key_prefix, topic)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    /// Requeue triggers a crashed consumer left in the processing list.
    ///
    /// Run once per topic at worker startup, before consumers subscribe.
    pub async fn recover_pending(&self, topic: Topic) -> Result<usize, BusError> {
        let mut conn = self.connection().await?;
        let queue = self.queue_key(topic);
        let processing = self.processing_key(topic);

        let pending: Vec<String> = conn
            .lrange(&processing, 0, -1)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        if pending.is_empty() {
            return Ok(0);
        }

        let recovered = pending.len();
        for payload in pending {
            conn.lpush::<_, _, ()>(&queue, payload)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;
        }
        conn.del::<_, ()>(&processing)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        tracing::info!(topic = %topic, recovered, "requeued pending triggers");
        Ok(recovered)
    }
}

#[async_trait]
impl TriggerBus for RedisTriggerBus {
    async fn publish(&self, topic: Topic, trigger: Trigger) -> Result<(), BusError> {
        let payload = serde_json::to_string(&trigger)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(self.queue_key(topic), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn TriggerStream>, BusError> {
        // Blocking commands get their own connection so they never stall
        // publishes sharing the client.
        let conn = self.connection().await?;
        Ok(Box::new(RedisTriggerStream {
            conn,
            queue_key: self.queue_key(topic),
            processing_key: self.processing_key(topic),
        }))
    }
}

struct RedisTriggerStream {
    conn: redis::aio::MultiplexedConnection,
    queue_key: String,
    processing_key: String,
}

#[async_trait]
impl TriggerStream for RedisTriggerStream {
    async fn recv(&mut self) -> Result<Option<Trigger>, BusError> {
        loop {
            let payload: Option<String> = redis::cmd("BLMOVE")
                .arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(BLOCK_SECONDS)
                .query_async(&mut self.conn)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;

            let Some(payload) = payload else {
                // Block timeout; poll again.
                continue;
            };

            let trigger: Trigger = serde_json::from_str(&payload)
                .map_err(|e| BusError::Serialization(e.to_string()))?;

            // Ack on take: a crash between BLMOVE and here leaves the
            // payload in the processing list for recover_pending.
            self.conn
                .lrem::<_, _, ()>(&self.processing_key, 1, &payload)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;

            return Ok(Some(trigger));
        }
    }
}
