//! # ReliefMesh Engines
//!
//! Boundaries to the external analysis functions the pipeline calls out to:
//! imagery analysis, plan generation, area-of-interest resolution, and the
//! inventory snapshot. Each boundary is a trait with an HTTP-backed
//! implementation and a deterministic fixture implementation for local
//! development and tests.
//!
//! The engines are opaque to the orchestration core: slow, expensive, and
//! allowed to fail. Timeout enforcement on top of these calls belongs to
//! the stage workers.

mod aoi;
mod http;
mod imagery;
mod inventory;
mod planning;

pub use aoi::{AoiResolver, StaticAoiResolver};
pub use http::HttpEngineConfig;
pub use imagery::{
    AnalysisOutcome, FixtureImageryAnalyzer, HttpImageryAnalyzer, ImageryAnalyzer,
};
pub use inventory::{InventoryProvider, InventorySnapshot, StaticInventoryProvider};
pub use planning::{FixturePlanGenerator, HttpPlanGenerator, PlanGenerator, PlanOutcome};

use thiserror::Error;

/// Engine invocation errors.
///
/// All variants are terminal for the owning request: the pipeline records
/// them as data and does not retry in-worker.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine returned status {status}: {message}")]
    BadStatus { status: u16, message: String },

    #[error("invalid engine response: {0}")]
    InvalidResponse(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}
