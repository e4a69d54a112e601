//! # ReliefMesh Runtime
//!
//! The three stage handlers of the pipeline and the plumbing that runs
//! them:
//! - IntakeRouter: accepts a rescue request, writes the initial record,
//!   publishes the first trigger
//! - DamageWorker: damage-analysis stage state machine
//! - LogisticsWorker: logistics-planning stage state machine
//! - Stage consumption loop and bounded publish retry
//! - RuntimeApp bootstrap from a single `reliefmesh.yaml`
//!
//! All coordination goes through the StateStore + TriggerBus pair; no
//! component calls another directly.

pub mod bootstrap;
pub mod damage;
pub mod intake;
pub mod logistics;
pub mod worker;

pub use bootstrap::{BootstrapError, PipelineComponents, RuntimeApp};
pub use damage::{DamageWorker, DamageWorkerConfig};
pub use intake::{IntakeError, IntakeRequest, IntakeRouter, IntakeRouterConfig};
pub use logistics::{LogisticsWorker, LogisticsWorkerConfig};
pub use worker::{
    publish_with_retry, run_consumer, spawn_consumers, StageError, StageOutcome, TriggerHandler,
};
