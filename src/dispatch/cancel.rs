//! Cooperative cancellation of running executions.
//!
//! Cancellation stops further recipient fan-out; tasks already in flight
//! run to their own terminal state. The flag is shared by value so the
//! orchestrator polls it without going back through the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct CancelRegistry {
    signals: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running execution and get its cancel flag.
    pub async fn register(&self, execution_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut signals = self.signals.lock().await;
        signals.insert(execution_id.to_string(), flag.clone());
        flag
    }

    /// Request cancellation. Returns false when the execution is not
    /// currently running.
    pub async fn request_cancel(&self, execution_id: &str) -> bool {
        let signals = self.signals.lock().await;
        match signals.get(execution_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Remove an execution after it reaches a terminal status.
    pub async fn unregister(&self, execution_id: &str) {
        let mut signals = self.signals.lock().await;
        signals.remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_flag_round_trip() {
        let registry = CancelRegistry::new();
        let flag = registry.register("exec-1").await;

        assert!(!flag.load(Ordering::SeqCst));
        assert!(registry.request_cancel("exec-1").await);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution_is_a_no_op() {
        let registry = CancelRegistry::new();
        assert!(!registry.request_cancel("missing").await);
    }

    #[tokio::test]
    async fn test_unregister_forgets_the_execution() {
        let registry = CancelRegistry::new();
        registry.register("exec-1").await;
        registry.unregister("exec-1").await;

        assert!(!registry.request_cancel("exec-1").await);
    }
}
