//! Cancellation tree.
//!
//! A root source fans out linked children; cancelling a source propagates to
//! every child atomically. Cancellation is one-way and idempotent, and only
//! the first reason is retained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::domain::errors::{SwarmError, SwarmResult};

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// A checkable, awaitable cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The first reason passed to `cancel`, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Error out if cancellation has been signalled.
    pub fn check(&self) -> SwarmResult<()> {
        if self.is_cancelled() {
            Err(SwarmError::Cancelled(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }

    /// Suspend until cancellation is signalled. Returns immediately when
    /// already cancelled.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn set(&self, reason: &str) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            if let Ok(mut guard) = self.inner.reason.lock() {
                guard.get_or_insert_with(|| reason.to_string());
            }
        }
        self.inner.notify.notify_waiters();
    }
}

#[derive(Debug)]
struct SourceInner {
    token: CancellationToken,
    children: Mutex<Vec<Arc<SourceInner>>>,
}

impl SourceInner {
    fn cancel(&self, reason: &str) {
        self.token.set(reason);
        let children = self
            .children
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        for child in children {
            child.cancel(reason);
        }
    }
}

/// Owner of a cancellation token and its linked children.
#[derive(Debug, Clone)]
pub struct CancellationSource {
    inner: Arc<SourceInner>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new_root()
    }
}

impl CancellationSource {
    /// Create an independent root source.
    pub fn new_root() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                token: CancellationToken::default(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Cancel this source and, transitively, every linked child.
    pub fn cancel(&self, reason: impl AsRef<str>) {
        self.inner.cancel(reason.as_ref());
    }

    /// Create a child source that is cancelled whenever this one is.
    ///
    /// A child created after the parent was cancelled starts cancelled.
    pub fn create_linked(&self) -> Self {
        let child = Self::new_root();
        if let Ok(mut children) = self.inner.children.lock() {
            children.push(child.inner.clone());
        }
        if self.inner.token.is_cancelled() {
            child.cancel(
                self.inner
                    .token
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string()),
            );
        }
        child
    }

    /// Release child links; subsequent cancellation no longer propagates.
    pub fn dispose(&self) {
        if let Ok(mut children) = self.inner.children.lock() {
            children.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_not_cancelled_initially() {
        let source = CancellationSource::new_root();
        assert!(!source.token().is_cancelled());
        assert!(source.token().check().is_ok());
    }

    #[test]
    fn test_cancel_sets_reason() {
        let source = CancellationSource::new_root();
        source.cancel("user requested");
        let token = source.token();
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user requested"));
        assert!(matches!(token.check(), Err(SwarmError::Cancelled(_))));
    }

    #[test]
    fn test_first_reason_wins() {
        let source = CancellationSource::new_root();
        source.cancel("first");
        source.cancel("second");
        assert_eq!(source.token().reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_linked_cancellation_propagates() {
        let parent = CancellationSource::new_root();
        let child = parent.create_linked();
        let grandchild = child.create_linked();

        parent.cancel("parent done");
        assert!(child.token().is_cancelled());
        assert!(grandchild.token().is_cancelled());
        assert_eq!(grandchild.token().reason().as_deref(), Some("parent done"));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = CancellationSource::new_root();
        let child = parent.create_linked();
        child.cancel("child done");
        assert!(child.token().is_cancelled());
        assert!(!parent.token().is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationSource::new_root();
        parent.cancel("already");
        let child = parent.create_linked();
        assert!(child.token().is_cancelled());
        assert_eq!(child.token().reason().as_deref(), Some("already"));
    }

    #[test]
    fn test_dispose_unlinks_children() {
        let parent = CancellationSource::new_root();
        let child = parent.create_linked();
        parent.dispose();
        parent.cancel("late");
        assert!(!child.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_cancel() {
        let source = CancellationSource::new_root();
        let token = source.token();

        let waiter = tokio::spawn(async move {
            token.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel("timeout");

        tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .expect("wait() must resolve within the propagation deadline")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_already_cancelled_returns_immediately() {
        let source = CancellationSource::new_root();
        source.cancel("done");
        tokio::time::timeout(Duration::from_millis(50), source.token().wait())
            .await
            .unwrap();
    }
}
