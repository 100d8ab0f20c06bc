//! Cache engine configuration.

use std::time::Duration;

const DEFAULT_REBUILD_WORKERS: usize = 4;
const DEFAULT_REBUILD_QUEUE: usize = 64;
const DEFAULT_MUTEX_LOCK_TTL: Duration = Duration::from_secs(10);
const DEFAULT_MUTEX_MAX_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_REBUILD_LOCK_TTL: Duration = Duration::from_secs(10);

/// Tunables for the cache-aside engine.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Worker tasks consuming the rebuild queue.
    pub rebuild_workers: usize,
    /// Rebuild queue capacity; overflow rejects and serves stale.
    pub rebuild_queue: usize,
    /// Lease TTL of the per-key lock in the lock-based read variant.
    pub mutex_lock_ttl: Duration,
    /// Total wait bound of the blocking acquire in the lock-based variant.
    pub mutex_max_wait: Duration,
    /// Lease TTL of the rebuild lock in the logical-expiration variant.
    /// Bounds how long a crashed rebuild can suppress further rebuilds.
    pub rebuild_lock_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
            rebuild_queue: DEFAULT_REBUILD_QUEUE,
            mutex_lock_ttl: DEFAULT_MUTEX_LOCK_TTL,
            mutex_max_wait: DEFAULT_MUTEX_MAX_WAIT,
            rebuild_lock_ttl: DEFAULT_REBUILD_LOCK_TTL,
        }
    }
}

impl CacheConfig {
    /// Worker count clamped to at least one.
    pub fn rebuild_workers_non_zero(&self) -> usize {
        self.rebuild_workers.max(1)
    }

    /// Queue capacity clamped to at least one.
    pub fn rebuild_queue_non_zero(&self) -> usize {
        self.rebuild_queue.max(1)
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            rebuild_workers: settings.rebuild_workers,
            rebuild_queue: settings.rebuild_queue,
            mutex_lock_ttl: settings.mutex_lock_ttl,
            mutex_max_wait: settings.mutex_max_wait,
            rebuild_lock_ttl: settings.rebuild_lock_ttl,
        }
    }
}
