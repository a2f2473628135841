//! Per-measure mutual exclusion
//!
//! Aggregation, purge, wildcard and rollback runs for one measure must never
//! overlap: a second run would read aggregate state the first one is about to
//! rewrite. Runs for different measures share nothing and proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide registry of one async mutex per measure name
#[derive(Debug, Clone, Default)]
pub struct MeasureLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MeasureLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `measure_name`
    ///
    /// The returned guard releases the measure when dropped.
    pub async fn acquire(&self, measure_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.entry(measure_name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_measure_is_serialized() {
        let locks = MeasureLocks::new();
        let guard = locks.acquire("dummy").await;

        let blocked = timeout(Duration::from_millis(50), locks.acquire("dummy")).await;
        assert!(blocked.is_err(), "second acquire should wait");

        drop(guard);
        let acquired = timeout(Duration::from_millis(500), locks.acquire("dummy")).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_different_measures_are_independent() {
        let locks = MeasureLocks::new();
        let _guard = locks.acquire("first").await;

        let other = timeout(Duration::from_millis(500), locks.acquire("second")).await;
        assert!(other.is_ok());
    }
}
