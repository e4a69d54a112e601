//! In-memory StateStore and TriggerBus implementations.
//!
//! Used for development and testing; durable backends live in the
//! reliefmesh-stores-backends plugin.

mod state_store;
mod trigger_bus;

pub use state_store::InMemoryStateStore;
pub use trigger_bus::InMemoryTriggerBus;
