//! Single-writer claim primitive.
//!
//! `claim` is the one correctness-critical operation of the pipeline: a
//! conditional create on the state store that admits exactly one worker
//! past a given stage for a given request, no matter how many duplicate
//! trigger deliveries race each other. Every other behavior composes
//! around it.

use serde::Serialize;

use crate::store::{put_doc_if_absent, Collection, CreateOutcome, StateStore, StoreError};
use crate::types::RequestId;

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the stage for this request and must proceed.
    Acquired,
    /// Another worker holds or held the claim; the caller must no-op.
    AlreadyPresent,
}

impl ClaimOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired)
    }
}

/// Attempt to claim a stage for a request by conditionally creating its
/// placeholder record.
pub async fn claim<T: Serialize + Sync>(
    store: &dyn StateStore,
    collection: Collection,
    id: &RequestId,
    placeholder: &T,
) -> Result<ClaimOutcome, StoreError> {
    match put_doc_if_absent(store, collection, id, placeholder).await? {
        CreateOutcome::Created => Ok(ClaimOutcome::Acquired),
        CreateOutcome::AlreadyExists => Ok(ClaimOutcome::AlreadyPresent),
    }
}
