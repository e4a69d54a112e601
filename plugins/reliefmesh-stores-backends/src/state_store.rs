//! Redis implementation of the StateStore.
//!
//! Documents are stored as JSON strings under
//! `{prefix}:{collection}:{request_id}`. Conditional create maps onto
//! `SET ... NX`, which is atomic on the server and therefore a valid claim
//! substrate. Updates are plain read-modify-write: the claim primitive
//! guarantees a single writer per record, so no transaction is needed.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use reliefmesh_core::store::{
    ChangeKind, Collection, CreateOutcome, RecordChange, StateStore, StoreError,
};
use reliefmesh_core::types::RequestId;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Redis-backed document store for the three pipeline collections.
pub struct RedisStateStore {
    client: redis::Client,
    key_prefix: String,
    changes: broadcast::Sender<RecordChange>,
}

impl RedisStateStore {
    /// Create a new Redis state store from a connection URL.
    pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(connection_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            changes,
        })
    }

    fn record_key(&self, collection: Collection, id: &RequestId) -> String {
        format!("{}:{}:{}", self.key_prefix, collection.as_str(), id)
    }

    fn changes_channel(&self) -> String {
        format!("{}:changes", self.key_prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Conditional write; `true` when this call created the key.
    async fn set_nx(&self, key: &str, payload: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn emit_change(&self, change: RecordChange) {
        // Local fan-out for in-process subscribers; cross-process observers
        // listen on the Redis channel. Neither is load-bearing for
        // correctness, so failures only log.
        if let Ok(payload) = serde_json::to_string(&change) {
            if let Ok(mut conn) = self.connection().await {
                let result: Result<(), redis::RedisError> =
                    conn.publish(self.changes_channel(), payload).await;
                if let Err(e) = result {
                    tracing::debug!(error = %e, "change publish to redis channel failed");
                }
            }
        }
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn create(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<(), StoreError> {
        let key = self.record_key(collection, id);
        let payload =
            serde_json::to_string(&doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if !self.set_nx(&key, &payload).await? {
            return Err(StoreError::Conflict(format!("{}/{}", collection, id)));
        }
        self.emit_change(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Created,
            doc,
        ))
        .await;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<CreateOutcome, StoreError> {
        let key = self.record_key(collection, id);
        let payload =
            serde_json::to_string(&doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if !self.set_nx(&key, &payload).await? {
            return Ok(CreateOutcome::AlreadyExists);
        }
        self.emit_change(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Created,
            doc,
        ))
        .await;
        Ok(CreateOutcome::Created)
    }

    async fn read(
        &self,
        collection: Collection,
        id: &RequestId,
    ) -> Result<Option<Value>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .get(self.record_key(collection, id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        match payload {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn update_fields(
        &self,
        collection: Collection,
        id: &RequestId,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let key = self.record_key(collection, id);
        let mut conn = self.connection().await?;

        let payload: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let payload =
            payload.ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))?;
        let mut doc: Value = serde_json::from_str(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let target = doc.as_object_mut().ok_or_else(|| {
            StoreError::Internal(format!("{}/{} is not a document object", collection, id))
        })?;
        for (field, value) in fields {
            target.insert(field, value);
        }

        let updated =
            serde_json::to_string(&doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.set::<_, _, ()>(&key, updated)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        self.emit_change(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Updated,
            doc,
        ))
        .await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
