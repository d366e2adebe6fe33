//! Configuration management infrastructure.

mod loader;

pub use loader::{normalize_capabilities, workers_from_raw, ConfigError, ConfigLoader, RawWorkerSpec};
