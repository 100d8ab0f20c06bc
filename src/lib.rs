//! Scorta: a cache-aside engine and flash-sale order-admission core.
//!
//! Three pillars, each useful on its own:
//!
//! - [`cache`]: cache-aside reads over a shared store in pass-through,
//!   logical-expiration, and lock-based variants.
//! - [`id`]: globally unique, roughly time-ordered 64-bit ids.
//! - [`seckill`]: atomic flash-sale admission plus asynchronous, idempotent
//!   order finalization off a durable stream.
//!
//! The shared store behind all of them is the [`store::SharedStore`] trait;
//! production wires [`infra::redis::RedisStore`], tests run against
//! [`store::MemoryStore`].

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod id;
pub mod infra;
pub mod lock;
pub mod seckill;
pub mod store;
