//! Domain model: identifiers, entities, and domain-level errors.

pub mod entities;
pub mod error;
pub mod types;
