//! File ledger domain models: claims and optimistic-concurrency versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An exclusive write-intent claim on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClaim {
    pub path: String,
    pub agent_id: String,
    pub task_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Snapshot of a file's content taken by a reader.
///
/// The `version_hash` is the base version a later [`WriteResult`]-producing
/// write declares; a missing file snapshots as the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub path: String,
    pub content_snapshot: String,
    pub version_hash: String,
    pub reader_agent_id: String,
}

/// Outcome of an optimistic-concurrency write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub conflict: bool,
    pub base_hash: String,
    pub current_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WriteResult {
    pub fn committed(hash: impl Into<String>) -> Self {
        let hash = hash.into();
        Self {
            success: true,
            conflict: false,
            base_hash: hash.clone(),
            current_hash: hash,
            reason: None,
        }
    }

    pub fn conflicted(base_hash: impl Into<String>, current_hash: impl Into<String>) -> Self {
        Self {
            success: false,
            conflict: true,
            base_hash: base_hash.into(),
            current_hash: current_hash.into(),
            reason: Some("base version superseded".to_string()),
        }
    }
}
