//! StateStore in-memory implementation.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

use reliefmesh_core::store::{
    ChangeKind, Collection, CreateOutcome, RecordChange, StateStore, StoreError,
};
use reliefmesh_core::types::RequestId;

const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// In-memory implementation for development and testing.
///
/// Conditional create is atomic under the collection write lock, which is
/// what the claim primitive relies on.
pub struct InMemoryStateStore {
    collections: RwLock<HashMap<Collection, HashMap<String, Value>>>,
    changes: broadcast::Sender<RecordChange>,
}

impl InMemoryStateStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Create a new in-memory store with a custom change channel capacity.
    pub fn with_change_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            collections: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Number of documents currently held in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .map(|c| c.get(&collection).map(|docs| docs.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    fn notify(&self, change: RecordChange) {
        // No receiver is not an error; the store remains source-of-truth.
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<(), StoreError> {
        {
            let mut collections = self
                .collections
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let docs = collections.entry(collection).or_default();
            if docs.contains_key(id.as_str()) {
                return Err(StoreError::Conflict(format!("{}/{}", collection, id)));
            }
            docs.insert(id.to_string(), doc.clone());
        }
        self.notify(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Created,
            doc,
        ));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        collection: Collection,
        id: &RequestId,
        doc: Value,
    ) -> Result<CreateOutcome, StoreError> {
        {
            let mut collections = self
                .collections
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let docs = collections.entry(collection).or_default();
            if docs.contains_key(id.as_str()) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            docs.insert(id.to_string(), doc.clone());
        }
        self.notify(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Created,
            doc,
        ));
        Ok(CreateOutcome::Created)
    }

    async fn read(
        &self,
        collection: Collection,
        id: &RequestId,
    ) -> Result<Option<Value>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id.as_str()))
            .cloned())
    }

    async fn update_fields(
        &self,
        collection: Collection,
        id: &RequestId,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut collections = self
                .collections
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let doc = collections
                .get_mut(&collection)
                .and_then(|docs| docs.get_mut(id.as_str()))
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))?;
            let target = doc.as_object_mut().ok_or_else(|| {
                StoreError::Internal(format!("{}/{} is not a document object", collection, id))
            })?;
            for (key, value) in fields {
                target.insert(key, value);
            }
            doc.clone()
        };
        self.notify(RecordChange::new(
            collection,
            id.clone(),
            ChangeKind::Updated,
            updated,
        ));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
