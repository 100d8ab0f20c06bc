//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{OrderId, ShopId, UserId, VoucherId};

/// A flash-sale voucher row: remaining stock plus the sale window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeckillVoucherRecord {
    pub voucher_id: VoucherId,
    pub stock: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub begin_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_at: OffsetDateTime,
}

impl SeckillVoucherRecord {
    /// Whether the sale window is open at `now`.
    pub fn window_open(&self, now: OffsetDateTime) -> bool {
        now >= self.begin_at && now <= self.end_at
    }
}

/// A persisted flash-sale order. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherOrderRecord {
    pub id: OrderId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A shop listing, cached through every cache-aside variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopRecord {
    pub id: ShopId,
    pub name: String,
    pub address: String,
    pub avg_price: i64,
    pub score: i32,
}
