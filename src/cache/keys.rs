//! Cache key namespaces.
//!
//! One namespace per entity type: a key prefix, a rebuild/mutex lock prefix,
//! and the TTL pair (full entries vs. negative entries).

use std::fmt::Display;
use std::time::Duration;

/// A cache key namespace with its TTL policy.
#[derive(Debug, Clone)]
pub struct Namespace {
    /// Short name used in logs and metric labels.
    pub name: &'static str,
    /// Key prefix for cached payloads.
    pub prefix: &'static str,
    /// Key prefix for the per-entry lock (rebuild or mutex, by variant).
    pub lock_prefix: &'static str,
    /// Physical TTL of full entries (pass-through and lock-based variants) and
    /// logical lifetime of envelope entries.
    pub ttl: Duration,
    /// Physical TTL of negative entries. Short, so a later insert into the
    /// backing store becomes visible quickly.
    pub negative_ttl: Duration,
}

impl Namespace {
    pub fn key(&self, id: impl Display) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn lock_key(&self, id: impl Display) -> String {
        format!("{}{}", self.lock_prefix, id)
    }
}

/// Shop listings.
pub const SHOP_NS: Namespace = Namespace {
    name: "shop",
    prefix: "cache:shop:",
    lock_prefix: "lock:shop:",
    ttl: Duration::from_secs(30 * 60),
    negative_ttl: Duration::from_secs(2 * 60),
};

/// Flash-sale vouchers (window + stock snapshot for admission validation).
pub const VOUCHER_NS: Namespace = Namespace {
    name: "voucher",
    prefix: "cache:voucher:",
    lock_prefix: "lock:voucher:",
    ttl: Duration::from_secs(30 * 60),
    negative_ttl: Duration::from_secs(2 * 60),
};
