//! Distributed lock plumbing over the shared store.
//!
//! A lock is a key holding a random token with a lease TTL. Acquisition is
//! set-if-absent; release is compare-and-delete on the token, so a lease that
//! expired and was re-acquired by someone else is never released by the old
//! holder. Crashed holders are cleaned up by lease expiry alone.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

use crate::store::{SharedStore, StoreError};

/// First retry delay of the blocking acquire loop.
const BACKOFF_INITIAL: Duration = Duration::from_millis(25);
/// Retry delay ceiling; backoff doubles until it gets here.
const BACKOFF_CAP: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock `{key}` after {waited_ms}ms")]
    Timeout { key: String, waited_ms: u128 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A held lease. Release is explicit; an unreleased lease lapses at TTL.
#[derive(Debug)]
pub struct LockLease {
    key: String,
    token: String,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquires and releases token-guarded leases on the shared store.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn SharedStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Single acquisition attempt. `Ok(None)` means someone else holds the key.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &token, ttl).await? {
            Ok(Some(LockLease {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Blocking acquisition with bounded exponential backoff and a total-wait
    /// bound. Exceeding `max_wait` surfaces [`LockError::Timeout`].
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockLease, LockError> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            if let Some(lease) = self.try_acquire(key, ttl).await? {
                return Ok(lease);
            }
            if Instant::now() + backoff > deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            debug!(key, backoff_ms = backoff.as_millis() as u64, "lock busy, backing off");
            sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Release `lease` if the stored token still matches. Returns false when
    /// the lease already lapsed (and possibly belongs to someone else now).
    pub async fn release(&self, lease: LockLease) -> Result<bool, LockError> {
        Ok(self
            .store
            .delete_if_equals(&lease.key, &lease.token)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn try_acquire_is_mutually_exclusive() {
        let locks = manager();
        let lease = locks
            .try_acquire("lock:order:1", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(
            locks
                .try_acquire("lock:order:1", Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );

        assert!(locks.release(lease).await.unwrap());
        assert!(
            locks
                .try_acquire("lock:order:1", Duration::from_secs(5))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn lease_expires_without_release() {
        let locks = manager();
        let _abandoned = locks
            .try_acquire("lock:shop:7", Duration::from_millis(30))
            .await
            .unwrap()
            .expect("acquired");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            locks
                .try_acquire("lock:shop:7", Duration::from_secs(1))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn stale_release_does_not_unlock_new_holder() {
        let locks = manager();
        let stale = locks
            .try_acquire("lock:shop:9", Duration::from_millis(20))
            .await
            .unwrap()
            .expect("acquired");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let _current = locks
            .try_acquire("lock:shop:9", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("lease lapsed, reacquired");

        // The stale holder's release must not free the new holder's lease.
        assert!(!locks.release(stale).await.unwrap());
        assert!(
            locks
                .try_acquire("lock:shop:9", Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() {
        let locks = manager();
        let _held = locks
            .try_acquire("lock:order:2", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("acquired");

        let err = locks
            .acquire("lock:order:2", Duration::from_secs(30), Duration::from_millis(80))
            .await
            .expect_err("bounded wait expires");
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn blocking_acquire_succeeds_once_released() {
        let locks = manager();
        let held = locks
            .try_acquire("lock:order:3", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("acquired");

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("lock:order:3", Duration::from_secs(30), Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        locks.release(held).await.unwrap();

        let lease = waiter.await.unwrap().expect("waiter wins after release");
        assert_eq!(lease.key(), "lock:order:3");
    }
}
