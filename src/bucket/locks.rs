//! Keyed mutual exclusion: at most one in-flight mutation per instance id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Dead entries are swept once the table grows past this many slots.
const PRUNE_THRESHOLD: usize = 1_024;

/// Table of per-instance async mutexes.
///
/// Slots are held weakly, so an instance's mutex lives exactly as long as some
/// caller holds or waits on it. Different instances never share a slot.
#[derive(Debug, Default)]
pub(crate) struct InstanceLocks {
    slots: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `instance`.
    pub(crate) async fn lock(&self, instance: &str) -> OwnedMutexGuard<()> {
        self.slot(instance).lock_owned().await
    }

    fn slot(&self, instance: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(live) = slots.get(instance).and_then(Weak::upgrade) {
            return live;
        }
        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, slot| slot.strong_count() > 0);
        }
        let fresh = Arc::new(AsyncMutex::new(()));
        slots.insert(instance.to_string(), Arc::downgrade(&fresh));
        fresh
    }

    #[cfg(test)]
    fn live_slots(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|s| s.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_instance_is_exclusive() {
        let locks = InstanceLocks::new();
        let _held = locks.lock("a").await;
        let second = tokio::time::timeout(Duration::from_millis(20), locks.lock("a")).await;
        assert!(second.is_err(), "second lock on the same instance must wait");
    }

    #[tokio::test]
    async fn different_instances_do_not_block() {
        let locks = InstanceLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(20), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_dropped() {
        let locks = InstanceLocks::new();
        {
            let _a = locks.lock("a").await;
            assert_eq!(locks.live_slots(), 1);
        }
        assert_eq!(locks.live_slots(), 0);
        let _again = locks.lock("a").await;
        assert_eq!(locks.live_slots(), 1);
    }
}
