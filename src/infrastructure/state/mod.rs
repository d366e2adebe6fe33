//! Run-state persistence.

mod store;

pub use store::{RunManifest, StateStore, TaskCheckpoint, STATE_SCHEMA_VERSION};
