//! Per-subject turn serialization.
//!
//! Two events for the same (flow, subject) pair must not interleave their
//! read-run-persist cycles. Each pair gets its own async mutex; turns for
//! different subjects proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-(flow, subject) locks.
#[derive(Clone, Default)]
pub struct SubjectLocks {
    locks: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one (flow, subject) pair, waiting if another
    /// turn holds it. The guard is owned so it can cross await points.
    pub async fn acquire(&self, flow_id: &str, subject_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry((flow_id.to_string(), subject_id.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop lock entries nobody currently holds or waits on. Called from
    /// the periodic maintenance sweep so the map does not grow with every
    /// subject ever seen.
    pub async fn prune(&self) -> usize {
        let mut map = self.locks.lock().await;
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - map.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
