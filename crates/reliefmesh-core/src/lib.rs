//! # ReliefMesh Core
//!
//! Core abstractions for the three-stage disaster-response pipeline.
//!
//! This crate contains:
//! - Record definitions: RescueRequest / DamageReport / LogisticsPlan
//! - StateStore trait (the only shared, durable coordination surface)
//! - TriggerBus trait (at-least-once stage triggering)
//! - The claim primitive every stage uses to stay idempotent
//!
//! This crate does NOT care about:
//! - How records are persisted (see reliefmesh-stores and the backends plugin)
//! - How the analysis/planning engines are invoked (see reliefmesh-engines)
//! - How workers are scheduled (see reliefmesh-runtime)

pub mod bus;
pub mod claim;
pub mod store;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bus::{BusError, Topic, Trigger, TriggerBus, TriggerStream};
    pub use crate::claim::{claim, ClaimOutcome};
    pub use crate::store::{
        create_doc, put_doc_if_absent, read_doc, update_doc, ChangeKind, Collection,
        CreateOutcome, RecordChange, StateStore, StoreError,
    };
    pub use crate::types::{
        AnalysisStatus, DamageCategory, DamageFinding, DamageReport, DeploymentAction,
        ImageryRefs, LogisticsPlan, PlanStatus, Priority, RequestId, RequestStatus, RescueRequest,
    };
}
