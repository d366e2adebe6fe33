//! On-disk run-state artifacts.
//!
//! Layout under the run root:
//! - `swarm.state.json` — full checkpoint
//! - `swarm.events.jsonl` — append-only event log (written by the event bus)
//! - `tasks/task-<id>.json` — per-task checkpoint
//! - `manifest.json` — run metadata
//!
//! Every write goes through write-temp + fsync + rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::errors::SwarmResult;
use crate::domain::models::config::SwarmConfig;
use crate::domain::models::plan::SwarmCheckpoint;
use crate::domain::models::task::{FailureMode, SwarmTask, TaskStatus};

/// Schema version of the persisted artifacts.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Run metadata written once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub goal: String,
    pub roles: Vec<String>,
    pub task_count: usize,
    pub budget_tokens: u64,
    pub merge_policy: String,
    pub created_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn for_run(run_id: Uuid, goal: &str, config: &SwarmConfig, task_count: usize) -> Self {
        let mut roles: Vec<String> = config
            .workers
            .iter()
            .map(|w| w.role.as_str().to_string())
            .collect();
        roles.sort_unstable();
        roles.dedup();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id,
            goal: goal.to_string(),
            roles,
            task_count,
            budget_tokens: config.budget.parent_total,
            merge_policy: format!("{:?}", config.conflict_strategy).to_lowercase(),
            created_at: Utc::now(),
        }
    }
}

/// Per-task checkpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_mode: Option<FailureMode>,
}

impl TaskCheckpoint {
    pub fn from_task(task: &SwarmTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            attempts: task.attempts,
            last_failure_mode: task.failure_history.last().copied(),
        }
    }
}

/// Writer for the run-state directory.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the event bus should append its JSONL log to.
    pub fn events_path(&self) -> PathBuf {
        self.root.join("swarm.events.jsonl")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("swarm.state.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        // Task ids are model-produced; keep the filename safe.
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root.join("tasks").join(format!("task-{safe}.json"))
    }

    pub async fn ensure_layout(&self) -> SwarmResult<()> {
        tokio::fs::create_dir_all(self.root.join("tasks")).await?;
        Ok(())
    }

    pub async fn write_manifest(&self, manifest: &RunManifest) -> SwarmResult<()> {
        self.write_atomic(&self.manifest_path(), &serde_json::to_vec_pretty(manifest)?)
            .await
    }

    pub async fn write_state(&self, checkpoint: &SwarmCheckpoint) -> SwarmResult<()> {
        self.write_atomic(&self.state_path(), &serde_json::to_vec_pretty(checkpoint)?)
            .await
    }

    pub async fn write_task(&self, task: &SwarmTask) -> SwarmResult<()> {
        let checkpoint = TaskCheckpoint::from_task(task);
        self.write_atomic(
            &self.task_path(&task.id),
            &serde_json::to_vec_pretty(&checkpoint)?,
        )
        .await
    }

    pub async fn read_state(&self) -> SwarmResult<SwarmCheckpoint> {
        let bytes = tokio::fs::read(self.state_path()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> SwarmResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
