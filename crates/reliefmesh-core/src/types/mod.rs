//! Record type definitions
//!
//! Three record kinds share one correlation key (`RequestId`) and follow an
//! append-then-terminal-update lifecycle: nothing is ever deleted by the
//! pipeline.

mod damage;
mod logistics;
mod request;

pub use damage::{AnalysisStatus, DamageCategory, DamageFinding, DamageReport};
pub use logistics::{DeploymentAction, LogisticsPlan, PlanStatus, Priority};
pub use request::{ImageryRefs, RequestId, RequestStatus, RescueRequest};
