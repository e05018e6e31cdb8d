//! Cooperative cancellation primitives.
//!
//! Cancellation is level-triggered: once a [`CancelFlag`] fires it stays
//! fired, and late subscribers observe it immediately. The
//! [`CancelRegistry`] maps live task ids to their flags so the facade can
//! signal a run it does not own a handle to.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::core::types::TaskId;

/// One-shot, clonable cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    /// Create a new, unfired flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the flag. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the flag has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag fires. Returns immediately if already fired.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first, so there is no window
        // between subscribing and waiting.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared map of in-flight task ids to their cancellation flags.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<RwLock<HashMap<TaskId, CancelFlag>>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh flag for a task, returning it.
    pub async fn register(&self, id: TaskId) -> CancelFlag {
        let flag = CancelFlag::new();
        self.inner.write().await.insert(id, flag.clone());
        flag
    }

    /// Look up the flag for a task, if it is still in flight.
    pub async fn get(&self, id: &TaskId) -> Option<CancelFlag> {
        self.inner.read().await.get(id).cloned()
    }

    /// Drop a task's flag. Idempotent.
    pub async fn remove(&self, id: &TaskId) {
        self.inner.write().await.remove(id);
    }

    /// Number of registered flags.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_flag_starts_unfired() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_fired() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancel(); // idempotent

        tokio::time::timeout(Duration::from_millis(100), flag.cancelled())
            .await
            .expect("already-fired flag should resolve immediately");
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_registry_register_get_remove() {
        let registry = CancelRegistry::new();
        let id = TaskId::new();

        let flag = registry.register(id).await;
        assert_eq!(registry.len().await, 1);

        let looked_up = registry.get(&id).await.unwrap();
        looked_up.cancel();
        assert!(flag.is_cancelled());

        registry.remove(&id).await;
        registry.remove(&id).await; // idempotent
        assert!(registry.get(&id).await.is_none());
        assert!(registry.is_empty().await);
    }
}
