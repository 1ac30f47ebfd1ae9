use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::ConcurrencyError;
use crate::operation::{resource_key, Operation};

/// Lock strength requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
    Exclusive,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "read"),
            LockType::Write => write!(f, "write"),
            LockType::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A request to lock `(resource_type, resource_id)` for an owner/session pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub lock_type: LockType,
    pub owner_id: String,
    pub session_id: String,
    /// Time-to-live for the lock to prevent orphaned locks
    pub timeout: Duration,
}

impl LockRequest {
    /// The write lock `execute` takes on behalf of an operation's author.
    pub fn write_for(operation: &Operation, timeout: Duration) -> Self {
        Self {
            resource_type: operation.resource_type.clone(),
            resource_id: operation.resource_id.clone(),
            lock_type: LockType::Write,
            owner_id: operation.user_id.clone(),
            session_id: operation.session_id.clone(),
            timeout,
        }
    }

    pub fn resource_key(&self) -> String {
        resource_key(&self.resource_type, &self.resource_id)
    }
}

/// A granted claim on a resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub resource_type: String,
    pub lock_type: LockType,
    pub owner_id: String,
    pub session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    /// Build the lock a request would be granted at `now`.
    pub fn grant(request: &LockRequest, now: DateTime<Utc>) -> Result<Self, ConcurrencyError> {
        Ok(Self {
            resource_id: request.resource_id.clone(),
            resource_type: request.resource_type.clone(),
            lock_type: request.lock_type,
            owner_id: request.owner_id.clone(),
            session_id: request.session_id.clone(),
            acquired_at: now,
            expires_at: expiry_after(now, request.timeout)?,
        })
    }

    pub fn resource_key(&self) -> String {
        resource_key(&self.resource_type, &self.resource_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_held_by(&self, owner_id: &str, session_id: &str) -> bool {
        self.owner_id == owner_id && self.session_id == session_id
    }

    /// Whether `request` may be granted while this lock is live.
    pub fn is_compatible_with(&self, request: &LockRequest) -> bool {
        if self.is_held_by(&request.owner_id, &request.session_id) {
            return true;
        }

        match (self.lock_type, request.lock_type) {
            (LockType::Exclusive, _) | (_, LockType::Exclusive) => false,
            (LockType::Write, _) | (_, LockType::Write) => false,
            (LockType::Read, LockType::Read) => true,
        }
    }
}

/// `now + ttl`, rejecting durations chrono cannot represent.
pub(crate) fn expiry_after(
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>, ConcurrencyError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| ConcurrencyError::Internal(format!("lock timeout {:?} out of range", ttl)))
}

/// Lock table abstraction for resource-scoped locking.
///
/// Locks are keyed on `(resource_type, resource_id)`. Acquisition never
/// blocks: a request is either granted immediately or refused, and callers
/// that want to wait must retry above this layer.
pub trait LockManager: Send + Sync {
    /// Returns the backend identifier (e.g., "memory").
    fn backend_name(&self) -> &'static str;

    /// Attempt to acquire a lock.
    ///
    /// An expired lock on the same key is evicted before compatibility is
    /// checked. Fails with `LockUnavailable` if a live, incompatible lock is
    /// held by another owner/session.
    fn acquire(&self, request: &LockRequest) -> Result<ResourceLock, ConcurrencyError>;

    /// Release the lock held by exactly this owner and session.
    fn release(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        session_id: &str,
    ) -> Result<(), ConcurrencyError>;

    /// Push the expiry of a held lock to `now + timeout`.
    fn renew(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        session_id: &str,
        timeout: Duration,
    ) -> Result<ResourceLock, ConcurrencyError>;

    /// The live lock on a resource, if any.
    fn get(&self, resource_type: &str, resource_id: &str) -> Option<ResourceLock>;

    /// Drop every expired lock, returning how many were removed.
    fn cleanup_expired(&self) -> usize;

    /// Snapshot of all non-expired locks keyed by resource key.
    fn active_locks(&self) -> HashMap<String, ResourceLock>;
}

/// Holds a granted lock and releases it when dropped.
///
/// Release runs on every exit path of the owning scope, including early
/// returns, errors and unwinding panics.
pub struct LockGuard<'a> {
    manager: &'a dyn LockManager,
    lock: ResourceLock,
}

impl<'a> LockGuard<'a> {
    /// Acquire `request` on `manager`, tying release to the guard's lifetime.
    pub fn acquire(
        manager: &'a dyn LockManager,
        request: &LockRequest,
    ) -> Result<Self, ConcurrencyError> {
        let lock = manager.acquire(request)?;
        Ok(Self { manager, lock })
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let lock = &self.lock;
        match self.manager.release(
            &lock.resource_type,
            &lock.resource_id,
            &lock.owner_id,
            &lock.session_id,
        ) {
            Ok(()) => debug!(
                "Guard released lock on {} for {}/{}",
                lock.resource_key(),
                lock.owner_id,
                lock.session_id
            ),
            Err(e) => error!(
                resource_type = %lock.resource_type,
                resource_id = %lock.resource_id,
                "Failed to release lock: {}",
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(owner: &str, session: &str, lock_type: LockType) -> LockRequest {
        LockRequest {
            resource_type: "record".to_string(),
            resource_id: "rec1".to_string(),
            lock_type,
            owner_id: owner.to_string(),
            session_id: session.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    fn held(owner: &str, session: &str, lock_type: LockType) -> ResourceLock {
        ResourceLock::grant(&request(owner, session, lock_type), Utc::now()).unwrap()
    }

    #[test]
    fn test_same_owner_and_session_is_reentrant() {
        let existing = held("user1", "s1", LockType::Exclusive);
        assert!(existing.is_compatible_with(&request("user1", "s1", LockType::Write)));
        assert!(existing.is_compatible_with(&request("user1", "s1", LockType::Exclusive)));
    }

    #[test]
    fn test_same_owner_other_session_is_not_reentrant() {
        let existing = held("user1", "s1", LockType::Write);
        assert!(!existing.is_compatible_with(&request("user1", "s2", LockType::Write)));
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockType::*;
        let cases = [
            (Read, Read, true),
            (Read, Write, false),
            (Read, Exclusive, false),
            (Write, Read, false),
            (Write, Write, false),
            (Write, Exclusive, false),
            (Exclusive, Read, false),
            (Exclusive, Write, false),
            (Exclusive, Exclusive, false),
        ];
        for (existing, requested, expected) in cases {
            let lock = held("user1", "s1", existing);
            assert_eq!(
                lock.is_compatible_with(&request("user2", "s2", requested)),
                expected,
                "{} vs {}",
                existing,
                requested
            );
        }
    }

    #[test]
    fn test_expiry_is_strict() {
        let lock = held("user1", "s1", LockType::Read);
        assert!(!lock.is_expired_at(lock.expires_at));
        assert!(lock.is_expired_at(lock.expires_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_out_of_range_timeout_is_rejected() {
        let mut req = request("user1", "s1", LockType::Write);
        req.timeout = Duration::from_secs(u64::MAX);
        let err = ResourceLock::grant(&req, Utc::now()).unwrap_err();
        assert!(matches!(err, ConcurrencyError::Internal(_)));
    }
}
