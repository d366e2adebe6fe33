//! Adapters for the provider and spawner ports.
//!
//! Real LLM and worker backends plug in from outside the crate; the mock
//! adapters here back the tests and the dry-run mode.

pub mod mock;

pub use mock::{MockProvider, MockSpawner};
