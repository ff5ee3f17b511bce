//! Per-call lock registry
//!
//! Serializes read-modify-write of one call within this process. Entries are
//! dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct CallLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, call_sid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(call_sid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_call_is_serialized() {
        let locks = Arc::new(CallLocks::new());
        let guard = locks.lock("CA1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("CA1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_calls_do_not_block() {
        let locks = CallLocks::new();
        let _a = locks.lock("CA1").await;
        let _b = locks.lock("CA2").await;
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = CallLocks::new();
        drop(locks.lock("CA1").await);
        drop(locks.lock("CA2").await);
        let _c = locks.lock("CA3").await;
        assert_eq!(locks.len().await, 1);
    }
}
