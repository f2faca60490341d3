//! Snapshot persistence for engine state.
//!
//! A snapshot holds every task, workflow and agent record. It is enough to
//! recover in-flight state after a restart; nothing else is persisted.

mod snapshot;
mod store;

pub use snapshot::{EngineSnapshot, SNAPSHOT_VERSION};
pub use store::StateStore;
