//! Swarm event model.
//!
//! Events are a tagged enum with a typed payload per variant; the `Info`
//! variant keeps a free-form `data` escape hatch for ad-hoc diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::FailureMode;

/// Typed payload carried by a [`SwarmEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SwarmEventPayload {
    /// A worker process was started for a task.
    Spawn {
        worker_id: String,
        model: String,
        attempt: u32,
    },
    /// A worker claimed exclusive write intent on a file.
    Claim { path: String },
    /// A file write committed under optimistic concurrency.
    Write { path: String, version_hash: String },
    /// A write or wave-composition conflict on a path.
    Conflict {
        path: String,
        base_hash: String,
        current_hash: String,
    },
    /// Task accepted by the quality gate.
    Complete {
        score: f64,
        degraded: bool,
        tokens_used: u64,
    },
    /// Task failed (possibly pending retry).
    Fail {
        failure_mode: FailureMode,
        attempt: u32,
        will_retry: bool,
    },
    /// Task skipped because a dependency failed.
    Skip { cause_task_id: String },
    /// Budget pool movement.
    Budget {
        allocated: u64,
        used: u64,
        available: u64,
    },
    /// Free-form diagnostic payload.
    Info { data: serde_json::Value },
    #[serde(rename = "wave.start")]
    WaveStart { wave: usize, task_count: usize },
    #[serde(rename = "wave.end")]
    WaveEnd {
        wave: usize,
        succeeded: usize,
        failed: usize,
    },
    #[serde(rename = "wave.review")]
    WaveReview {
        wave: usize,
        assessment: String,
        fixup_count: usize,
    },
    /// Orchestrator phase transition.
    Phase { phase: String },
    /// A worker reported a provider rate limit.
    RateLimit { model: String },
    /// The dispatch circuit breaker changed state.
    CircuitBreaker { active: bool, pause_ms: u64 },
}

impl SwarmEventPayload {
    /// The wire-level event type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Claim { .. } => "claim",
            Self::Write { .. } => "write",
            Self::Conflict { .. } => "conflict",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Skip { .. } => "skip",
            Self::Budget { .. } => "budget",
            Self::Info { .. } => "info",
            Self::WaveStart { .. } => "wave.start",
            Self::WaveEnd { .. } => "wave.end",
            Self::WaveReview { .. } => "wave.review",
            Self::Phase { .. } => "phase",
            Self::RateLimit { .. } => "rate_limit",
            Self::CircuitBreaker { .. } => "circuit_breaker",
        }
    }
}

/// An event observed on the swarm event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(flatten)]
    pub payload: SwarmEventPayload,
    #[serde(default)]
    pub message: String,
}

impl SwarmEvent {
    pub fn new(payload: SwarmEventPayload, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: None,
            agent_id: None,
            payload,
            message: message.into(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let event = SwarmEvent::new(
            SwarmEventPayload::Spawn {
                worker_id: "w1".into(),
                model: "model-a".into(),
                attempt: 1,
            },
            "spawned w1",
        )
        .for_task("t1")
        .for_agent("w1");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "spawn");
        assert_eq!(json["data"]["worker_id"], "w1");
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn test_dotted_wave_kinds() {
        let event = SwarmEvent::new(
            SwarmEventPayload::WaveStart {
                wave: 1,
                task_count: 3,
            },
            "",
        );
        assert_eq!(event.kind(), "wave.start");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "wave.start");
    }

    #[test]
    fn test_roundtrip() {
        let event = SwarmEvent::new(
            SwarmEventPayload::Fail {
                failure_mode: FailureMode::Timeout,
                attempt: 2,
                will_retry: false,
            },
            "t3 timed out",
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: SwarmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "fail");
        assert_eq!(back.message, "t3 timed out");
    }
}
