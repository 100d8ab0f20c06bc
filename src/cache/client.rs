//! The cache-aside client: three read variants plus explicit warms.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use crate::application::repos::RepoError;
use crate::lock::{LockError, LockManager};
use crate::store::{SharedStore, StoreError};

use super::config::CacheConfig;
use super::keys::Namespace;
use super::rebuild::RebuildPool;

pub const METRIC_CACHE_HIT: &str = "scorta_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "scorta_cache_miss_total";
pub const METRIC_CACHE_NEGATIVE_HIT: &str = "scorta_cache_negative_hit_total";
pub const METRIC_CACHE_STALE_SERVED: &str = "scorta_cache_stale_served_total";
pub const METRIC_CACHE_REBUILD_SCHEDULED: &str = "scorta_cache_rebuild_scheduled_total";
pub const METRIC_CACHE_REBUILD_REJECTED: &str = "scorta_cache_rebuild_rejected_total";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Load(#[from] RepoError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("cache payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Payload envelope of the logical-expiration variant. The entry carries its
/// own expiry; the store-level TTL is never set.
#[derive(Debug, Serialize, Deserialize)]
struct LogicalEnvelope<T> {
    expire_at_ms: i64,
    data: T,
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

enum CacheRead<T> {
    Hit(T),
    Negative,
    Miss,
}

/// Cache-aside engine over the shared store.
pub struct CacheClient {
    store: Arc<dyn SharedStore>,
    locks: LockManager,
    rebuilds: RebuildPool,
    config: CacheConfig,
}

impl CacheClient {
    /// Requires a running tokio runtime (spawns the rebuild workers).
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        let locks = LockManager::new(Arc::clone(&store));
        let rebuilds = RebuildPool::new(
            config.rebuild_workers_non_zero(),
            config.rebuild_queue_non_zero(),
        );
        Self {
            store,
            locks,
            rebuilds,
            config,
        }
    }

    /// Pass-through read. Misses run the loader on the caller task and write
    /// back a full entry, or a short-TTL negative entry when the backing
    /// store has nothing. Races on miss are benign (idempotent writes).
    pub async fn read_through<T, F, Fut>(
        &self,
        ns: &Namespace,
        id: impl Display,
        load: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RepoError>>,
    {
        let key = ns.key(&id);
        match self.read_entry::<T>(&key).await? {
            CacheRead::Hit(value) => {
                counter!(METRIC_CACHE_HIT, "namespace" => ns.name).increment(1);
                return Ok(Some(value));
            }
            CacheRead::Negative => {
                counter!(METRIC_CACHE_NEGATIVE_HIT, "namespace" => ns.name).increment(1);
                return Ok(None);
            }
            CacheRead::Miss => {
                counter!(METRIC_CACHE_MISS, "namespace" => ns.name).increment(1);
            }
        }

        self.load_and_fill(ns, &key, load).await
    }

    /// Lock-based read: misses serialize behind a per-key distributed lock
    /// with a double-checked re-read, so one miss episode runs the loader at
    /// most once. Exceeding the bounded lock wait surfaces an error.
    pub async fn read_with_lock<T, F, Fut>(
        &self,
        ns: &Namespace,
        id: impl Display,
        load: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RepoError>>,
    {
        let key = ns.key(&id);
        match self.read_entry::<T>(&key).await? {
            CacheRead::Hit(value) => {
                counter!(METRIC_CACHE_HIT, "namespace" => ns.name).increment(1);
                return Ok(Some(value));
            }
            CacheRead::Negative => {
                counter!(METRIC_CACHE_NEGATIVE_HIT, "namespace" => ns.name).increment(1);
                return Ok(None);
            }
            CacheRead::Miss => {
                counter!(METRIC_CACHE_MISS, "namespace" => ns.name).increment(1);
            }
        }

        let lease = self
            .locks
            .acquire(
                &ns.lock_key(&id),
                self.config.mutex_lock_ttl,
                self.config.mutex_max_wait,
            )
            .await?;

        // Double check under the lock: a concurrent holder may have filled
        // the entry while this task waited.
        let outcome = async {
            match self.read_entry::<T>(&key).await? {
                CacheRead::Hit(value) => Ok(Some(value)),
                CacheRead::Negative => Ok(None),
                CacheRead::Miss => self.load_and_fill(ns, &key, load).await,
            }
        }
        .await;

        if let Err(err) = self.locks.release(lease).await {
            warn!(key, error = %err, "failed to release cache mutex lock");
        }
        outcome
    }

    /// Logical-expiration read. Absent entries mean "never warmed" and return
    /// `None`. Expired entries are served stale immediately while at most one
    /// background rebuild per key refreshes the envelope; a full rebuild
    /// backlog rejects the task and keeps serving stale.
    pub async fn read_with_logical_expire<T, F, Fut>(
        &self,
        ns: &Namespace,
        id: impl Display,
        load: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, RepoError>> + Send + 'static,
    {
        let key = ns.key(&id);
        let Some(payload) = self.store.get(&key).await? else {
            counter!(METRIC_CACHE_MISS, "namespace" => ns.name).increment(1);
            return Ok(None);
        };

        let envelope = match serde_json::from_str::<LogicalEnvelope<T>>(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(key, error = %err, "corrupt logical cache entry, treating as absent");
                return Ok(None);
            }
        };

        if envelope.expire_at_ms > now_ms() {
            counter!(METRIC_CACHE_HIT, "namespace" => ns.name).increment(1);
            return Ok(Some(envelope.data));
        }

        counter!(METRIC_CACHE_STALE_SERVED, "namespace" => ns.name).increment(1);
        if let Some(lease) = self
            .locks
            .try_acquire(&ns.lock_key(&id), self.config.rebuild_lock_ttl)
            .await?
        {
            match self.rebuilds.try_begin() {
                Some(slot) => {
                    counter!(METRIC_CACHE_REBUILD_SCHEDULED, "namespace" => ns.name).increment(1);
                    let store = Arc::clone(&self.store);
                    let locks = self.locks.clone();
                    let ttl = ns.ttl;
                    let name = ns.name;
                    let key = key.clone();
                    slot.submit(Box::pin(async move {
                        match load().await {
                            Ok(Some(value)) => {
                                if let Err(err) =
                                    write_logical(store.as_ref(), &key, &value, ttl).await
                                {
                                    warn!(key, error = %err, "cache rebuild write failed");
                                }
                            }
                            Ok(None) => {
                                warn!(
                                    key,
                                    namespace = name,
                                    "entity gone during rebuild, stale entry left in place"
                                );
                            }
                            Err(err) => {
                                warn!(key, error = %err, "cache rebuild load failed");
                            }
                        }
                        if let Err(err) = locks.release(lease).await {
                            warn!(key, error = %err, "failed to release rebuild lock");
                        }
                    }));
                }
                None => {
                    // Backlog full: reject-and-serve-stale. The lock goes
                    // back so a later read can retry the rebuild.
                    counter!(METRIC_CACHE_REBUILD_REJECTED, "namespace" => ns.name).increment(1);
                    if let Err(err) = self.locks.release(lease).await {
                        warn!(key, error = %err, "failed to release rebuild lock");
                    }
                }
            }
        }

        Ok(Some(envelope.data))
    }

    /// Write a full entry with the namespace's physical TTL.
    pub async fn warm<T: Serialize>(
        &self,
        ns: &Namespace,
        id: impl Display,
        value: &T,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.store
            .set(&ns.key(&id), &payload, Some(ns.ttl))
            .await?;
        Ok(())
    }

    /// Write a logical-expiration entry (no physical TTL, envelope expiry at
    /// now + namespace TTL).
    pub async fn warm_logical<T: Serialize>(
        &self,
        ns: &Namespace,
        id: impl Display,
        value: &T,
    ) -> Result<(), CacheError> {
        write_logical(self.store.as_ref(), &ns.key(&id), value, ns.ttl).await
    }

    /// Drop an entry so the next read goes to the backing store.
    pub async fn evict(&self, ns: &Namespace, id: impl Display) -> Result<(), CacheError> {
        self.store.delete(&ns.key(&id)).await?;
        Ok(())
    }

    async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<CacheRead<T>, CacheError> {
        match self.store.get(key).await? {
            None => Ok(CacheRead::Miss),
            Some(payload) if payload.is_empty() => Ok(CacheRead::Negative),
            Some(payload) => match serde_json::from_str::<T>(&payload) {
                Ok(value) => Ok(CacheRead::Hit(value)),
                Err(err) => {
                    // Fail open: a corrupt entry must not wedge the key.
                    warn!(key, error = %err, "corrupt cache entry, treating as miss");
                    Ok(CacheRead::Miss)
                }
            },
        }
    }

    async fn load_and_fill<T, F, Fut>(
        &self,
        ns: &Namespace,
        key: &str,
        load: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RepoError>>,
    {
        match load().await? {
            Some(value) => {
                let payload = serde_json::to_string(&value)?;
                self.store.set(key, &payload, Some(ns.ttl)).await?;
                Ok(Some(value))
            }
            None => {
                // Confirmed absence: a negative entry blunts repeated
                // penetration of the same nonexistent key.
                self.store.set(key, "", Some(ns.negative_ttl)).await?;
                Ok(None)
            }
        }
    }
}

async fn write_logical<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let envelope = LogicalEnvelope {
        expire_at_ms: now_ms() + ttl.as_millis() as i64,
        data: value,
    };
    let payload = serde_json::to_string(&envelope)?;
    store.set(key, &payload, None).await?;
    Ok(())
}
