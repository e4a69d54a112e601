//! State store abstraction
//!
//! The state store is the only shared, durable coordination surface of the
//! pipeline. It is modeled as a key-document service: three collections
//! keyed by request id, with create, conditional create, point read, field
//! update, and change subscription.
//!
//! Note: implementations live in reliefmesh-stores (in-memory) and the
//! reliefmesh-stores-backends plugin (Redis).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::RequestId;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The three pipeline collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Requests,
    DamageReports,
    LogisticsPlans,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Requests,
        Collection::DamageReports,
        Collection::LogisticsPlans,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Requests => "RescueRequests",
            Collection::DamageReports => "DamageReports",
            Collection::LogisticsPlans => "LogisticsPlans",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Kind of change carried by a subscription notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
}

/// Change notification delivered to store subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordChange {
    pub collection: Collection,
    pub request_id: RequestId,
    pub kind: ChangeKind,
    /// Snapshot of the document after the change.
    pub doc: Value,
    pub timestamp: DateTime<Utc>,
}

impl RecordChange {
    pub fn new(collection: Collection, request_id: RequestId, kind: ChangeKind, doc: Value) -> Self {
        Self {
            collection,
            request_id,
            kind,
            doc,
            timestamp: Utc::now(),
        }
    }
}

/// StateStore trait - async interface to the shared document store.
///
/// `put_if_absent` is the correctness-critical operation: it must be atomic
/// with respect to concurrent callers so the claim primitive can guarantee
/// a single winner per key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a document; `Conflict` if the key already exists.
    async fn create(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<(), StoreError>;

    /// Conditional create: write only if the key is absent.
    async fn put_if_absent(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<CreateOutcome, StoreError>;

    /// Point read; `None` if the key is absent.
    async fn read(&self, collection: Collection, id: &RequestId)
        -> Result<Option<Value>, StoreError>;

    /// Shallow-merge `fields` into an existing document; `NotFound` if the
    /// key is absent.
    async fn update_fields(
        &self,
        collection: Collection,
        id: &RequestId,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Subscribe to change notifications across all collections.
    fn subscribe(&self) -> broadcast::Receiver<RecordChange>;
}

/// Read and deserialize a document.
pub async fn read_doc<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: Collection,
    id: &RequestId,
) -> Result<Option<T>, StoreError> {
    match store.read(collection, id).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Serialize and create a document.
pub async fn create_doc<T: Serialize + Sync>(
    store: &dyn StateStore,
    collection: Collection,
    id: &RequestId,
    record: &T,
) -> Result<(), StoreError> {
    let doc = serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.create(collection, id, doc).await
}

/// Serialize and conditionally create a document.
pub async fn put_doc_if_absent<T: Serialize + Sync>(
    store: &dyn StateStore,
    collection: Collection,
    id: &RequestId,
    record: &T,
) -> Result<CreateOutcome, StoreError> {
    let doc = serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put_if_absent(collection, id, doc).await
}

/// Serialize a full record into an update of all its fields.
///
/// The claim primitive guarantees a single writer per record, so replacing
/// every field is equivalent to a document set.
pub async fn update_doc<T: Serialize + Sync>(
    store: &dyn StateStore,
    collection: Collection,
    id: &RequestId,
    record: &T,
) -> Result<(), StoreError> {
    let doc = serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let fields = match doc {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Serialization(format!(
                "record must serialize to an object, got {}",
                other
            )))
        }
    };
    store.update_fields(collection, id, fields).await
}
