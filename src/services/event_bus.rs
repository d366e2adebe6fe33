//! Event bus for swarm event streaming.
//!
//! Pub/sub over typed [`SwarmEvent`]s with a bounded in-memory history ring,
//! an optional broadcast channel for async consumers, and a best-effort JSONL
//! sink. Subscribers are isolated: a panicking subscriber never affects the
//! emitter or other subscribers.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::models::event::SwarmEvent;

/// Callback subscriber.
pub type EventListener = Arc<dyn Fn(&SwarmEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// History ring capacity; oldest events are evicted first.
    pub history_capacity: usize,
    /// When set, every event is appended as one JSON object per line.
    pub persist_path: Option<PathBuf>,
    /// Capacity of the broadcast channel for async consumers.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 4096,
            persist_path: None,
            channel_capacity: 1024,
        }
    }
}

struct BusState {
    subscribers: Vec<(SubscriberId, EventListener)>,
    history: VecDeque<SwarmEvent>,
    sink: Option<File>,
    sink_failed: bool,
}

/// Pub/sub bus with bounded history.
pub struct EventBus {
    config: EventBusConfig,
    state: Mutex<BusState>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let sink = config.persist_path.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| warn!(path = %path.display(), error = %e, "event sink unavailable"))
                .ok()
        });
        let (broadcast_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                history: VecDeque::new(),
                sink,
                sink_failed: false,
            }),
            next_id: AtomicU64::new(1),
            broadcast_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// Publish an event to all subscribers, the history ring, the broadcast
    /// channel, and the JSONL sink. Never fails; sink errors are logged.
    pub fn emit(&self, event: SwarmEvent) {
        let listeners: Vec<EventListener> = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            state.history.push_back(event.clone());
            while state.history.len() > self.config.history_capacity {
                state.history.pop_front();
            }

            if !state.sink_failed {
                if let Some(sink) = state.sink.as_mut() {
                    let line = serde_json::to_string(&event).unwrap_or_default();
                    if let Err(e) = writeln!(sink, "{line}") {
                        warn!(error = %e, "event persistence failed; disabling sink");
                        state.sink_failed = true;
                    }
                }
            }

            state
                .subscribers
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        for listener in listeners {
            // A panicking subscriber must not poison the others.
            let result = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                warn!(kind = event.kind(), "event subscriber panicked");
            }
        }

        // No receivers is not an error.
        let _ = self.broadcast_tx.send(event);
    }

    /// Register a callback subscriber.
    pub fn subscribe(&self, listener: EventListener) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.subscribers.push((id, listener));
        id
    }

    /// Remove a subscriber. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        state.subscribers.len() != before
    }

    /// Receiver for async consumers; lagging receivers drop events without
    /// affecting publishing.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<SwarmEvent> {
        self.broadcast_tx.subscribe()
    }

    /// The last `n` events in emit order.
    pub fn recent(&self, n: usize) -> Vec<SwarmEvent> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// The full retained history in emit order.
    pub fn history(&self) -> Vec<SwarmEvent> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.history.len()
    }
}
