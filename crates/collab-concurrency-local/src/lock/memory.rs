use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use collab_concurrency_core::{
    resource_key, ConcurrencyError, LockManager, LockRequest, ResourceLock,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

/// In-process lock table.
///
/// One slot per resource key: `{resource_type}:{resource_id}` -> current holder.
/// A compatible grant (re-entrant re-acquire, or a read joining a read)
/// replaces the slot with the newest holder and expiry. Check-then-grant
/// runs under the shard's write lock, so two incompatible requests can
/// never both win.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: DashMap<String, ResourceLock>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_owned(
        resource_key: String,
        owner_id: &str,
        session_id: &str,
        reason: &'static str,
    ) -> ConcurrencyError {
        ConcurrencyError::LockNotOwned {
            resource_key,
            owner_id: owner_id.to_string(),
            session_id: session_id.to_string(),
            reason,
        }
    }
}

impl LockManager for MemoryLockManager {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    fn acquire(&self, request: &LockRequest) -> Result<ResourceLock, ConcurrencyError> {
        let key = request.resource_key();
        let now = Utc::now();
        let lock = ResourceLock::grant(request, now)?;

        match self.locks.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.is_expired_at(now) {
                    debug!(
                        "Lock on {} expired (was held by {}), acquiring for {}",
                        entry.key(),
                        existing.owner_id,
                        request.owner_id
                    );
                } else if !existing.is_compatible_with(request) {
                    debug!(
                        "Lock on {} held by {} until {} (requested by {})",
                        entry.key(),
                        existing.owner_id,
                        existing.expires_at,
                        request.owner_id
                    );
                    return Err(ConcurrencyError::LockUnavailable {
                        resource_key: entry.key().clone(),
                        holder: existing.owner_id.clone(),
                    });
                }
                entry.insert(lock.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(lock.clone());
            }
        }

        debug!(
            "Acquired {} lock on {} for {} (expires at {})",
            lock.lock_type,
            lock.resource_key(),
            lock.owner_id,
            lock.expires_at
        );
        Ok(lock)
    }

    #[instrument(skip(self), level = "debug")]
    fn release(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        session_id: &str,
    ) -> Result<(), ConcurrencyError> {
        let key = resource_key(resource_type, resource_id);

        match self.locks.entry(key) {
            Entry::Occupied(entry) => {
                if !entry.get().is_held_by(owner_id, session_id) {
                    debug!(
                        "Cannot release lock on {}: held by {} not {}",
                        entry.key(),
                        entry.get().owner_id,
                        owner_id
                    );
                    return Err(Self::not_owned(
                        entry.key().clone(),
                        owner_id,
                        session_id,
                        "not_owner",
                    ));
                }
                let (key, _) = entry.remove_entry();
                debug!("Released lock on {} by {}", key, owner_id);
                Ok(())
            }
            Entry::Vacant(entry) => {
                debug!("Lock on {} not found for release by {}", entry.key(), owner_id);
                Err(Self::not_owned(
                    entry.into_key(),
                    owner_id,
                    session_id,
                    "not_found",
                ))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn renew(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        session_id: &str,
        timeout: Duration,
    ) -> Result<ResourceLock, ConcurrencyError> {
        let key = resource_key(resource_type, resource_id);
        let now = Utc::now();

        let Some(mut lock) = self.locks.get_mut(&key) else {
            return Err(Self::not_owned(key, owner_id, session_id, "not_found"));
        };
        if lock.is_expired_at(now) {
            drop(lock);
            self.locks.remove_if(&key, |_, lock| lock.is_expired_at(now));
            return Err(Self::not_owned(key, owner_id, session_id, "not_found"));
        }
        if !lock.is_held_by(owner_id, session_id) {
            return Err(Self::not_owned(key, owner_id, session_id, "not_owner"));
        }

        let renewed = ResourceLock::grant(
            &LockRequest {
                resource_type: lock.resource_type.clone(),
                resource_id: lock.resource_id.clone(),
                lock_type: lock.lock_type,
                owner_id: lock.owner_id.clone(),
                session_id: lock.session_id.clone(),
                timeout,
            },
            now,
        )?;
        lock.expires_at = renewed.expires_at;

        debug!(
            "Renewed lock on {} for {} (new expiry: {})",
            key, owner_id, lock.expires_at
        );
        Ok(ResourceLock::clone(&lock))
    }

    fn get(&self, resource_type: &str, resource_id: &str) -> Option<ResourceLock> {
        let now = Utc::now();
        self.locks
            .get(&resource_key(resource_type, resource_id))
            .filter(|lock| !lock.is_expired_at(now))
            .map(|lock| ResourceLock::clone(&lock))
    }

    #[instrument(skip(self), level = "debug")]
    fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.locks.retain(|key, lock| {
            if lock.is_expired_at(now) {
                debug!("Evicting expired lock on {} held by {}", key, lock.owner_id);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    fn active_locks(&self) -> HashMap<String, ResourceLock> {
        let now = Utc::now();
        self.locks
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_concurrency_core::LockType;

    fn request(owner: &str, lock_type: LockType, timeout: Duration) -> LockRequest {
        LockRequest {
            resource_type: "record".to_string(),
            resource_id: "rec1".to_string(),
            lock_type,
            owner_id: owner.to_string(),
            session_id: format!("{}-session", owner),
            timeout,
        }
    }

    fn write(owner: &str) -> LockRequest {
        request(owner, LockType::Write, Duration::from_secs(30))
    }

    #[test]
    fn test_acquire_release() {
        let lock_mgr = MemoryLockManager::new();

        // Acquire lock
        let lock = lock_mgr.acquire(&write("user1")).unwrap();
        assert_eq!(lock.owner_id, "user1");
        assert_eq!(lock.lock_type, LockType::Write);

        // Different holder cannot acquire
        let err = lock_mgr.acquire(&write("user2")).unwrap_err();
        assert_eq!(err.to_string(), "resource record:rec1 is locked by user user1");

        // Release lock
        lock_mgr
            .release("record", "rec1", "user1", "user1-session")
            .unwrap();

        // Now user2 can acquire
        assert!(lock_mgr.acquire(&write("user2")).is_ok());
    }

    #[test]
    fn test_reentrant_acquire() {
        let lock_mgr = MemoryLockManager::new();
        lock_mgr.acquire(&write("user1")).unwrap();

        // Same holder can re-acquire, even with a stronger lock type
        let again = lock_mgr
            .acquire(&request("user1", LockType::Exclusive, Duration::from_secs(30)))
            .unwrap();
        assert_eq!(again.lock_type, LockType::Exclusive);
        assert_eq!(lock_mgr.active_locks().len(), 1);
    }

    #[test]
    fn test_read_locks_share() {
        let lock_mgr = MemoryLockManager::new();
        let read = |owner| request(owner, LockType::Read, Duration::from_secs(30));

        assert!(lock_mgr.acquire(&read("user1")).is_ok());
        assert!(lock_mgr.acquire(&read("user2")).is_ok());

        // A writer is still refused while readers are live
        assert!(matches!(
            lock_mgr.acquire(&write("user3")),
            Err(ConcurrencyError::LockUnavailable { .. })
        ));
    }

    #[test]
    fn test_release_not_owner() {
        let lock_mgr = MemoryLockManager::new();
        lock_mgr.acquire(&write("user1")).unwrap();

        // user2 tries to release
        let err = lock_mgr
            .release("record", "rec1", "user2", "user2-session")
            .unwrap_err();
        assert!(matches!(
            err,
            ConcurrencyError::LockNotOwned { reason: "not_owner", .. }
        ));

        // Same user from another session does not own it either
        assert!(lock_mgr
            .release("record", "rec1", "user1", "other-session")
            .is_err());

        // Lock should still be held by user1
        assert_eq!(lock_mgr.get("record", "rec1").unwrap().owner_id, "user1");
    }

    #[test]
    fn test_release_missing_lock() {
        let lock_mgr = MemoryLockManager::new();
        let err = lock_mgr
            .release("record", "nope", "user1", "user1-session")
            .unwrap_err();
        assert!(matches!(
            err,
            ConcurrencyError::LockNotOwned { reason: "not_found", .. }
        ));
    }

    #[test]
    fn test_resource_isolation() {
        let lock_mgr = MemoryLockManager::new();
        lock_mgr.acquire(&write("user1")).unwrap();

        // Same id under another resource type is a different key
        let mut other = write("user2");
        other.resource_type = "table".to_string();
        assert!(lock_mgr.acquire(&other).is_ok());

        let mut other = write("user2");
        other.resource_id = "rec2".to_string();
        assert!(lock_mgr.acquire(&other).is_ok());

        assert_eq!(lock_mgr.active_locks().len(), 3);
    }

    #[tokio::test]
    async fn test_expired_lock_is_evicted_on_acquire() {
        let lock_mgr = MemoryLockManager::new();

        // Acquire with very short TTL
        lock_mgr
            .acquire(&request("user1", LockType::Exclusive, Duration::from_millis(1)))
            .unwrap();

        // Wait for expiration
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock_mgr.active_locks().is_empty());
        assert!(lock_mgr.get("record", "rec1").is_none());

        // Another holder can now acquire
        let lock = lock_mgr.acquire(&write("user2")).unwrap();
        assert_eq!(lock.owner_id, "user2");
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let lock_mgr = MemoryLockManager::new();
        lock_mgr
            .acquire(&request("user1", LockType::Write, Duration::from_millis(1)))
            .unwrap();
        let mut live = write("user2");
        live.resource_id = "rec2".to_string();
        lock_mgr.acquire(&live).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(lock_mgr.cleanup_expired(), 1);
        let active = lock_mgr.active_locks();
        assert_eq!(active.len(), 1);
        assert!(active.contains_key("record:rec2"));
        assert_eq!(lock_mgr.cleanup_expired(), 0);
    }

    #[tokio::test]
    async fn test_renew() {
        let lock_mgr = MemoryLockManager::new();
        let original = lock_mgr.acquire(&write("user1")).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let renewed = lock_mgr
            .renew("record", "rec1", "user1", "user1-session", Duration::from_secs(60))
            .unwrap();
        assert!(renewed.expires_at > original.expires_at);
        assert_eq!(renewed.acquired_at, original.acquired_at);

        // Cannot renew with wrong holder
        let err = lock_mgr
            .renew("record", "rec1", "user2", "user2-session", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(
            err,
            ConcurrencyError::LockNotOwned { reason: "not_owner", .. }
        ));
    }

    #[tokio::test]
    async fn test_renew_expired_lock_fails() {
        let lock_mgr = MemoryLockManager::new();
        lock_mgr
            .acquire(&request("user1", LockType::Write, Duration::from_millis(1)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = lock_mgr
            .renew("record", "rec1", "user1", "user1-session", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(
            err,
            ConcurrencyError::LockNotOwned { reason: "not_found", .. }
        ));
        assert!(lock_mgr.active_locks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_are_exclusive() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let lock_mgr = Arc::new(MemoryLockManager::new());

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let granted = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_TASKS {
            let lock_mgr = Arc::clone(&lock_mgr);
            let barrier = Arc::clone(&barrier);
            let granted = Arc::clone(&granted);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if lock_mgr.acquire(&write(&format!("user{}", i))).is_ok() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        // Exactly one writer wins the race
        assert_eq!(granted.load(Ordering::SeqCst), 1);
        assert_eq!(lock_mgr.active_locks().len(), 1);
    }
}
