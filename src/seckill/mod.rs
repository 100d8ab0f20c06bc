//! Flash-sale order admission pipeline.
//!
//! The synchronous half ([`SeckillService`]) validates the sale window from
//! the voucher cache and runs the atomic admission step on the shared store;
//! admitted attempts land on a durable stream. The asynchronous half
//! ([`OrderPersister`]) consumes that stream through a consumer group and
//! finalizes each order against the relational store, idempotently, so a
//! crash between delivery and acknowledgement costs nothing but a replay.

mod persister;
mod record;
mod service;

pub use persister::{
    METRIC_ORDERS_FINALIZED, METRIC_PERSISTER_POISON, OrderPersister, PersisterConfig,
    PersisterError,
};
pub use record::{AdmissionRecord, RecordError};
pub use service::{
    METRIC_SECKILL_ADMITTED, METRIC_SECKILL_REJECTED, ORDER_ID_PREFIX, SeckillError,
    SeckillService,
};
