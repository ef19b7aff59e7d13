//! Per-user mutual exclusion
//!
//! Every state-changing billing operation for a user (charge, renewal, retry,
//! cancel, webhook transition, trial start, refund) runs while holding that
//! user's guard, so the scheduler, API requests and webhook deliveries of one
//! process never interleave on the same rows. Writers in other processes are
//! caught by the store's version check.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Idle entries are pruned once the table grows past this size
const PRUNE_THRESHOLD: usize = 1024;

/// Keyed async mutex, one slot per user
#[derive(Clone, Default)]
pub struct UserLocks {
    slots: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Held for the duration of one user's critical section
pub struct UserLockGuard {
    user_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl UserLockGuard {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the user's billing state
    pub async fn lock(&self, user_id: Uuid) -> UserLockGuard {
        if self.slots.len() > PRUNE_THRESHOLD {
            self.prune();
        }

        // Clone the slot out so the map shard is not held across the await
        let slot = self
            .slots
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        UserLockGuard {
            user_id,
            _guard: slot.lock_owned().await,
        }
    }

    /// Drop slots nobody holds or waits on
    pub fn prune(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_user_is_serialized() {
        let locks = UserLocks::new();
        let user_id = Uuid::new_v4();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(user_id).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_users_do_not_block() {
        let locks = UserLocks::new();
        let first = locks.lock(Uuid::new_v4()).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4()))
            .await
            .expect("other user must not wait");
        assert_ne!(first.user_id(), second.user_id());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_slots() {
        let locks = UserLocks::new();
        let held_user = Uuid::new_v4();
        let _held = locks.lock(held_user).await;
        drop(locks.lock(Uuid::new_v4()).await);

        assert_eq!(locks.len(), 2);
        locks.prune();
        assert_eq!(locks.len(), 1);
    }
}
