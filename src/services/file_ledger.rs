//! File ledger: per-file claims and optimistic-concurrency writes.
//!
//! Claims express exclusive write intent; versions enforce that a writer's
//! observed base hash still matches the file on disk at commit time. Writes
//! to the same path are linearized by a per-path mutex; different paths
//! proceed concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::errors::SwarmResult;
use crate::domain::models::event::{SwarmEvent, SwarmEventPayload};
use crate::domain::models::ledger::{FileClaim, FileVersion, WriteResult};
use crate::services::event_bus::EventBus;

/// Fields of one optimistic write attempt.
#[derive(Debug, Clone)]
pub struct WriteAttempt {
    pub path: String,
    pub agent_id: String,
    pub task_id: String,
    pub new_content: String,
    pub base_hash: String,
}

/// Hash used for file versions.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Ledger over a run's working directory.
pub struct FileLedger {
    root: PathBuf,
    claims: Mutex<HashMap<String, FileClaim>>,
    /// Per-path write locks, created lazily.
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for FileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedger")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claims: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Claim exclusive write intent on a path. Returns `true` iff no other
    /// agent holds an active claim. Re-claiming one's own path is idempotent.
    pub async fn claim(&self, path: &str, agent_id: &str, task_id: &str) -> bool {
        let mut claims = self.claims.lock().await;
        match claims.get(path) {
            Some(existing) if existing.agent_id != agent_id => false,
            Some(_) => true,
            None => {
                claims.insert(
                    path.to_string(),
                    FileClaim {
                        path: path.to_string(),
                        agent_id: agent_id.to_string(),
                        task_id: task_id.to_string(),
                        claimed_at: Utc::now(),
                    },
                );
                true
            }
        }
    }

    /// Release a claim held by `agent_id`. Idempotent; a foreign claim is
    /// left untouched.
    pub async fn release(&self, path: &str, agent_id: &str) {
        let mut claims = self.claims.lock().await;
        if claims.get(path).is_some_and(|c| c.agent_id == agent_id) {
            claims.remove(path);
        }
    }

    /// Release every claim held by an agent (called on task completion).
    pub async fn release_all(&self, agent_id: &str) {
        let mut claims = self.claims.lock().await;
        claims.retain(|_, claim| claim.agent_id != agent_id);
    }

    pub async fn active_claims(&self) -> HashMap<String, FileClaim> {
        self.claims.lock().await.clone()
    }

    /// Snapshot the current content of a path for a reader. Missing files
    /// snapshot as the empty string; multiple concurrent readers are allowed.
    pub async fn snapshot(&self, path: &str, agent_id: &str) -> SwarmResult<FileVersion> {
        let absolute = self.absolute(path);
        let content = match tokio::fs::read_to_string(&absolute).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(FileVersion {
            path: path.to_string(),
            version_hash: content_hash(&content),
            content_snapshot: content,
            reader_agent_id: agent_id.to_string(),
        })
    }

    /// Attempt an optimistic write.
    ///
    /// Under the path's mutex the file is re-read from disk; if its current
    /// hash differs from the declared base the attempt fails with a conflict
    /// and nothing is mutated. Otherwise the content is committed atomically
    /// (temp file + fsync + rename).
    pub async fn attempt_write(&self, attempt: WriteAttempt) -> SwarmResult<WriteResult> {
        let lock = self.path_lock(&attempt.path).await;
        let _guard = lock.lock().await;

        let absolute = self.absolute(&attempt.path);
        let current = match tokio::fs::read_to_string(&absolute).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let current_hash = content_hash(&current);

        if current_hash != attempt.base_hash {
            debug!(path = %attempt.path, agent = %attempt.agent_id, "write conflict");
            if let Some(bus) = &self.event_bus {
                bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::Conflict {
                            path: attempt.path.clone(),
                            base_hash: attempt.base_hash.clone(),
                            current_hash: current_hash.clone(),
                        },
                        format!("write conflict on {}", attempt.path),
                    )
                    .for_task(attempt.task_id.clone())
                    .for_agent(attempt.agent_id.clone()),
                );
            }
            return Ok(WriteResult::conflicted(attempt.base_hash, current_hash));
        }

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = absolute.with_extension("codeswarm.tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(attempt.new_content.as_bytes()).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &absolute).await?;

        let new_hash = content_hash(&attempt.new_content);
        if let Some(bus) = &self.event_bus {
            bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Write {
                        path: attempt.path.clone(),
                        version_hash: new_hash.clone(),
                    },
                    format!("wrote {}", attempt.path),
                )
                .for_task(attempt.task_id)
                .for_agent(attempt.agent_id),
            );
        }
        Ok(WriteResult::committed(new_hash))
    }
}
