//! Shared key-value store abstraction.
//!
//! Everything the cache engine, the lock plumbing, the id generator, and the
//! admission pipeline need from the networked store is expressed here as one
//! async trait: string get/set with TTL, set-if-absent, compare-and-delete,
//! an atomic counter, the atomic admission operation, and an append-only
//! stream with consumer-group semantics.
//!
//! Production uses [`crate::infra::redis::RedisStore`]; tests and local
//! development use [`MemoryStore`], which honours the same atomicity contract
//! by executing the admission step under a single mutex.

mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

use crate::domain::types::{OrderId, UserId, VoucherId};

/// Prefix of the per-voucher stock counter seeded at publish time.
pub const STOCK_KEY_PREFIX: &str = "seckill:stock:";
/// Prefix of the per-voucher dedupe marker set.
pub const DEDUPE_KEY_PREFIX: &str = "seckill:order:";

/// Key of the stock counter checked and decremented by the admission step.
pub fn stock_key(voucher_id: VoucherId) -> String {
    format!("{STOCK_KEY_PREFIX}{voucher_id}")
}

/// Key of the dedupe marker set consulted by the admission step.
pub fn dedupe_key(voucher_id: VoucherId) -> String {
    format!("{DEDUPE_KEY_PREFIX}{voucher_id}")
}

/// Stream field holding the order id.
pub const FIELD_ORDER_ID: &str = "id";
/// Stream field holding the voucher id.
pub const FIELD_VOUCHER_ID: &str = "voucherId";
/// Stream field holding the user id.
pub const FIELD_USER_ID: &str = "userId";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store backend error: {message}")]
    Backend { message: String },
    #[error("shared store returned malformed data for `{key}`: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of the atomic admission operation.
///
/// Wire values match the admission script: 0 = ok, 1 = stock exhausted,
/// 2 = duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    Admitted,
    StockExhausted,
    Duplicate,
}

impl AdmissionStatus {
    pub fn from_wire(code: i64) -> Result<Self, StoreError> {
        match code {
            0 => Ok(Self::Admitted),
            1 => Ok(Self::StockExhausted),
            2 => Ok(Self::Duplicate),
            other => Err(StoreError::backend(format!(
                "admission script returned unknown status {other}"
            ))),
        }
    }
}

/// Inputs of the atomic admission operation.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest {
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub order_id: OrderId,
}

/// One entry read from the durable admission stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Cursor for consumer-group reads: fresh deliveries or the pending replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Deliver the next entry never seen by this group (`>`).
    New,
    /// Replay this consumer's oldest unacknowledged entry (`0`).
    Pending,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a string value. `Ok(None)` means the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value, with a physical TTL when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Write `value` under `key` with `ttl` only if the key is absent.
    /// Returns whether the write happened. Lock acquisition primitive.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `value`, atomically.
    /// Returns whether a deletion happened. Lock release primitive.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Atomically increment the integer at `key` (creating it at 0) and return
    /// the post-increment value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// The flash-sale admission step. In one indivisible operation: check
    /// remaining stock, check the per-user dedupe marker, and on success
    /// decrement stock, record the marker, and append the admission record to
    /// `stream`. Rejected attempts mutate nothing and never reach the stream.
    async fn admit(
        &self,
        request: AdmissionRequest,
        stream: &str,
    ) -> Result<AdmissionStatus, StoreError>;

    /// Create the consumer group for `stream` if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Read at most one entry for `(group, consumer)` at `position`. For
    /// [`ReadPosition::New`], waits up to `block` before returning `Ok(None)`;
    /// the pending replay never blocks.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_status_maps_script_codes() {
        assert_eq!(AdmissionStatus::from_wire(0).unwrap(), AdmissionStatus::Admitted);
        assert_eq!(
            AdmissionStatus::from_wire(1).unwrap(),
            AdmissionStatus::StockExhausted
        );
        assert_eq!(AdmissionStatus::from_wire(2).unwrap(), AdmissionStatus::Duplicate);
        assert!(AdmissionStatus::from_wire(3).is_err());
    }

    #[test]
    fn admission_keys_are_per_voucher() {
        let id = VoucherId::new(12);
        assert_eq!(stock_key(id), "seckill:stock:12");
        assert_eq!(dedupe_key(id), "seckill:order:12");
    }
}
