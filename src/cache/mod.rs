//! Cache-aside engine.
//!
//! Mediates reads between callers and the shared store for arbitrary
//! cacheable entities, in three variants:
//!
//! - **Pass-through**: read, fall back to the loader on miss, write back.
//!   Negative entries (empty payload, short TTL) absorb repeated lookups for
//!   keys that do not exist in the backing store (penetration).
//! - **Logical expiration**: entries never physically expire; staleness lives
//!   in the payload envelope. Expired reads serve the stale value immediately
//!   and hand the rebuild to a bounded background pool, at most one rebuild in
//!   flight per key (breakdown, bounded staleness).
//! - **Lock-based**: concurrent misses on one hot key serialize behind a
//!   distributed lock with a double-checked re-read, so the loader runs at
//!   most once per miss episode (breakdown).

mod client;
mod config;
mod keys;
mod rebuild;

pub use client::{
    CacheClient, CacheError, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_NEGATIVE_HIT,
    METRIC_CACHE_REBUILD_REJECTED, METRIC_CACHE_REBUILD_SCHEDULED, METRIC_CACHE_STALE_SERVED,
};
pub use config::CacheConfig;
pub use keys::{Namespace, SHOP_NS, VOUCHER_NS};
pub use rebuild::{METRIC_REBUILD_COMPLETED, RebuildJob, RebuildPool, RebuildSlot};
