use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::config::SwarmConfig;
use crate::domain::models::worker::{SwarmWorkerSpec, WorkerCapability, WorkerRole};

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_workers: {0}. Must be between 1 and 100")]
    InvalidMaxWorkers(usize),

    #[error("Invalid budget: parent_total must be positive")]
    EmptyBudget,

    #[error("Invalid reserve_percent: {0}. Must be within [0.0, 0.9]")]
    InvalidReservePercent(f64),

    #[error("Invalid min_allocation: {0}. Cannot be 0")]
    InvalidMinAllocation(u64),

    #[error("Invalid base_timeout_ms: {0}. Must be positive")]
    InvalidTimeout(u64),

    #[error("Invalid circuit breaker threshold: {0}. Cannot be 0")]
    InvalidBreakerThreshold(usize),

    #[error("Worker {worker} has unknown role: {role}")]
    UnknownRole { worker: String, role: String },

    #[error("Worker {worker} has unknown capability: {capability}")]
    UnknownCapability { worker: String, capability: String },

    #[error("Worker {0} declares no capabilities")]
    NoCapabilities(String),
}

/// Worker entry as written in YAML, before alias normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWorkerSpec {
    pub worker_id: String,
    pub model: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkerSection {
    #[serde(default)]
    workers: Vec<RawWorkerSpec>,
}

/// Normalize capability names, accepting common aliases (`code`, `tests`).
pub fn normalize_capabilities(
    worker: &str,
    raw: &[String],
) -> Result<std::collections::BTreeSet<WorkerCapability>, ConfigError> {
    let mut capabilities = std::collections::BTreeSet::new();
    for name in raw {
        let capability = WorkerCapability::parse_alias(name).ok_or_else(|| {
            ConfigError::UnknownCapability {
                worker: worker.to_string(),
                capability: name.clone(),
            }
        })?;
        capabilities.insert(capability);
    }
    Ok(capabilities)
}

fn parse_role(worker: &str, role: &str) -> Result<WorkerRole, ConfigError> {
    match role.to_lowercase().as_str() {
        "coder" => Ok(WorkerRole::Coder),
        "researcher" => Ok(WorkerRole::Researcher),
        "reviewer" => Ok(WorkerRole::Reviewer),
        "tester" => Ok(WorkerRole::Tester),
        "designer" => Ok(WorkerRole::Designer),
        other => Err(ConfigError::UnknownRole {
            worker: worker.to_string(),
            role: other.to_string(),
        }),
    }
}

/// Convert raw YAML worker entries into typed specs.
pub fn workers_from_raw(raw: &[RawWorkerSpec]) -> Result<Vec<SwarmWorkerSpec>, ConfigError> {
    raw.iter()
        .map(|entry| {
            let capabilities = normalize_capabilities(&entry.worker_id, &entry.capabilities)?;
            if capabilities.is_empty() {
                return Err(ConfigError::NoCapabilities(entry.worker_id.clone()));
            }
            Ok(SwarmWorkerSpec {
                worker_id: entry.worker_id.clone(),
                model: entry.model.clone(),
                role: parse_role(&entry.worker_id, &entry.role)?,
                capabilities,
                max_concurrency: entry.max_concurrency.max(1),
            })
        })
        .collect()
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .codeswarm/config.yaml (project config)
    /// 3. .codeswarm/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CODESWARM_* prefix, highest priority)
    pub fn load() -> Result<SwarmConfig> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(SwarmConfig::default()))
                .merge(Yaml::file(".codeswarm/config.yaml"))
                .merge(Yaml::file(".codeswarm/local.yaml"))
                .merge(Env::prefixed("CODESWARM_").split("__")),
        )
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<SwarmConfig> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(SwarmConfig::default()))
                .merge(Yaml::file(path.as_ref())),
        )
    }

    fn from_figment(figment: Figment) -> Result<SwarmConfig> {
        let mut config: SwarmConfig = figment
            .extract()
            .context("Failed to extract configuration from figment")?;

        // Worker entries are re-read raw so capability aliases normalize.
        let raw: RawWorkerSection = figment.extract().unwrap_or_default();
        if !raw.workers.is_empty() {
            config.workers = workers_from_raw(&raw.workers)?;
        }

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &SwarmConfig) -> Result<(), ConfigError> {
        if config.max_workers == 0 || config.max_workers > 100 {
            return Err(ConfigError::InvalidMaxWorkers(config.max_workers));
        }
        if config.budget.parent_total == 0 {
            return Err(ConfigError::EmptyBudget);
        }
        if !(0.0..=0.9).contains(&config.budget.reserve_percent) {
            return Err(ConfigError::InvalidReservePercent(
                config.budget.reserve_percent,
            ));
        }
        if config.budget.min_allocation == 0 {
            return Err(ConfigError::InvalidMinAllocation(config.budget.min_allocation));
        }
        if config.base_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(config.base_timeout_ms));
        }
        if config.recovery.circuit_breaker_threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold(
                config.recovery.circuit_breaker_threshold,
            ));
        }
        Ok(())
    }
}
