//! Infrastructure adapters: Redis-backed shared store, Postgres repositories,
//! and telemetry bootstrap.

pub mod db;
pub mod error;
pub mod redis;
pub mod telemetry;

pub use error::InfraError;
