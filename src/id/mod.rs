//! Global unique id generation.
//!
//! Ids are `(seconds since the service epoch) << 32 | daily sequence`. The
//! sequence comes from an atomic counter keyed per prefix and calendar day, so
//! ids are pairwise distinct across any number of concurrent callers and the
//! sequence restarts each day. Ordering holds at one-second granularity only.

use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::store::{SharedStore, StoreError};

/// 2024-12-23T00:00:00Z. Fixed forever; moving it would re-issue old ids.
const EPOCH_SECONDS: i64 = 1_734_912_000;
const SEQUENCE_BITS: u32 = 32;
const COUNTER_KEY_PREFIX: &str = "icr";

#[derive(Debug, Error)]
pub enum IdError {
    #[error("daily id sequence exhausted for prefix `{prefix}`")]
    SequenceExhausted { prefix: String },
    #[error("clock is before the id epoch")]
    ClockBeforeEpoch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hands out globally unique, roughly time-ordered 64-bit ids.
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn SharedStore>,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn next_id(&self, prefix: &str) -> Result<u64, IdError> {
        self.next_id_at(prefix, OffsetDateTime::now_utc()).await
    }

    async fn next_id_at(&self, prefix: &str, now: OffsetDateTime) -> Result<u64, IdError> {
        let elapsed = now.unix_timestamp() - EPOCH_SECONDS;
        if elapsed < 0 {
            return Err(IdError::ClockBeforeEpoch);
        }

        let day = now
            .format(format_description!("[year]:[month]:[day]"))
            .map_err(|err| StoreError::backend(format!("failed to format counter day: {err}")))?;
        let counter_key = format!("{COUNTER_KEY_PREFIX}:{prefix}:{day}");
        let sequence = self.store.increment(&counter_key).await?;

        // The sequence occupies the low 32 bits; wrapping into the timestamp
        // bits would silently collide, so overflow is rejected outright.
        if sequence < 0 || sequence > i64::from(u32::MAX) {
            return Err(IdError::SequenceExhausted {
                prefix: prefix.to_string(),
            });
        }

        Ok(((elapsed as u64) << SEQUENCE_BITS) | sequence as u64)
    }
}
