//! Redis store/bus backend implementations.

mod state_store;
mod trigger_bus;

pub use state_store::RedisStateStore;
pub use trigger_bus::RedisTriggerBus;

pub use reliefmesh_core::bus::{BusError, Topic, Trigger, TriggerBus, TriggerStream};
pub use reliefmesh_core::store::{
    ChangeKind, Collection, CreateOutcome, RecordChange, StateStore, StoreError,
};
