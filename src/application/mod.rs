//! Application services and persistence-port traits.

pub mod error;
pub mod repos;
pub mod shops;
