//! Repository traits describing the backing relational store.
//!
//! The core never talks SQL directly; it goes through these ports. Postgres
//! adapters live in `infra::db`, and test suites supply in-memory fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{SeckillVoucherRecord, ShopRecord, VoucherOrderRecord};
use crate::domain::types::{ShopId, UserId, VoucherId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result of asking the backing store to finalize an admitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Stock decremented and the order row inserted.
    Created,
    /// An order for this (voucher, user) already exists; nothing was written.
    AlreadyExists,
    /// The voucher row had no stock left; nothing was written.
    StockExhausted,
}

#[async_trait]
pub trait VouchersRepo: Send + Sync {
    async fn find_voucher(
        &self,
        voucher_id: VoucherId,
    ) -> Result<Option<SeckillVoucherRecord>, RepoError>;
}

#[async_trait]
pub trait OrdersRepo: Send + Sync {
    async fn find_order(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<Option<VoucherOrderRecord>, RepoError>;

    /// Finalize one admitted order: inside a single transaction, re-check that
    /// no order exists for (voucher, user), decrement voucher stock bounded by
    /// `stock > 0`, and insert the order row. Idempotent under redelivery.
    async fn finalize_order(
        &self,
        order: &VoucherOrderRecord,
    ) -> Result<FinalizeOutcome, RepoError>;
}

#[async_trait]
pub trait ShopsRepo: Send + Sync {
    async fn find_shop(&self, shop_id: ShopId) -> Result<Option<ShopRecord>, RepoError>;
}
