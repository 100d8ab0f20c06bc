//! In-process [`SharedStore`] double.
//!
//! Backs the test suites and local development. A single mutex around the
//! whole state gives the admission operation the same indivisibility the Lua
//! script has on the production backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use super::{
    AdmissionRequest, AdmissionStatus, FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID,
    ReadPosition, SharedStore, StoreError, StreamEntry, dedupe_key, stock_key,
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next entry never delivered to this group.
    cursor: usize,
    /// Delivered-but-unacknowledged entry ids, oldest first.
    pending: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamState>,
}

/// Deterministic in-memory shared store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "memory_store.state",
                    result = "poisoned_recovered",
                    "Recovered from poisoned store mutex"
                );
                poisoned.into_inner()
            }
        }
    }

    fn live_value(state: &mut State, key: &str, now: Instant) -> Option<String> {
        match state.strings.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                state.strings.remove(key);
                None
            }
            None => None,
        }
    }

    /// Number of entries ever appended to `stream`. Test observability.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.guard()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Append arbitrary fields to `stream`, bypassing admission. Lets tests
    /// plant malformed entries.
    #[cfg(test)]
    pub fn append_raw(&self, stream: &str, fields: HashMap<String, String>) -> String {
        let mut state = self.guard();
        append_entry(state.streams.entry(stream.to_string()).or_default(), fields)
    }

    /// Unacknowledged entry ids for `(stream, group)`. Test observability.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.guard()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.clone())
            .unwrap_or_default()
    }
}

fn append_entry(stream: &mut StreamState, fields: HashMap<String, String>) -> String {
    stream.next_seq += 1;
    let id = format!("{}-0", stream.next_seq);
    stream.entries.push(StreamEntry {
        id: id.clone(),
        fields,
    });
    id
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.guard();
        Ok(Self::live_value(&mut state, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.guard();
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guard().strings.remove(key);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.guard();
        let now = Instant::now();
        if Self::live_value(&mut state, key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut state = self.guard();
        let now = Instant::now();
        match Self::live_value(&mut state, key, now) {
            Some(current) if current == value => {
                state.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.guard();
        let now = Instant::now();
        let current = match Self::live_value(&mut state, key, now) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|err| StoreError::malformed(key, err.to_string()))?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = state.strings.get(key).and_then(|entry| entry.expires_at);
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn admit(
        &self,
        request: AdmissionRequest,
        stream: &str,
    ) -> Result<AdmissionStatus, StoreError> {
        let mut state = self.guard();
        let now = Instant::now();

        let stock_key = stock_key(request.voucher_id);
        let stock = match Self::live_value(&mut state, &stock_key, now) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|err| StoreError::malformed(&stock_key, err.to_string()))?,
            // Unseeded voucher reads as sold out, never as an error.
            None => 0,
        };
        if stock <= 0 {
            return Ok(AdmissionStatus::StockExhausted);
        }

        let dedupe_key = dedupe_key(request.voucher_id);
        let user = request.user_id.to_string();
        if state
            .sets
            .get(&dedupe_key)
            .is_some_and(|members| members.contains(&user))
        {
            return Ok(AdmissionStatus::Duplicate);
        }

        state.strings.insert(
            stock_key,
            StringEntry {
                value: (stock - 1).to_string(),
                expires_at: None,
            },
        );
        state.sets.entry(dedupe_key).or_default().insert(user);

        let fields = HashMap::from([
            (FIELD_ORDER_ID.to_string(), request.order_id.to_string()),
            (FIELD_VOUCHER_ID.to_string(), request.voucher_id.to_string()),
            (FIELD_USER_ID.to_string(), request.user_id.to_string()),
        ]);
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        append_entry(stream_state, fields);

        Ok(AdmissionStatus::Admitted)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut state = self.guard();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        stream_state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        position: ReadPosition,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut state = self.guard();
                let stream_state = state.streams.entry(stream.to_string()).or_default();
                let entries_len = stream_state.entries.len();
                let group_state = stream_state.groups.entry(group.to_string()).or_default();

                match position {
                    ReadPosition::New => {
                        if group_state.cursor < entries_len {
                            let entry = stream_state.entries[group_state.cursor].clone();
                            group_state.pending.push(entry.id.clone());
                            group_state.cursor += 1;
                            return Ok(Some(entry));
                        }
                    }
                    ReadPosition::Pending => {
                        let Some(id) = group_state.pending.first().cloned() else {
                            return Ok(None);
                        };
                        let entry = stream_state
                            .entries
                            .iter()
                            .find(|entry| entry.id == id)
                            .cloned()
                            .ok_or_else(|| {
                                StoreError::malformed(stream, format!("pending id `{id}` missing"))
                            })?;
                        return Ok(Some(entry));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), StoreError> {
        let mut state = self.guard();
        if let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.retain(|id| id != entry_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderId, UserId, VoucherId};

    fn request(voucher: u64, user: u64, order: u64) -> AdmissionRequest {
        AdmissionRequest {
            voucher_id: VoucherId::new(voucher),
            user_id: UserId::new(user),
            order_id: OrderId::new(order),
        }
    }

    #[tokio::test]
    async fn strings_respect_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_if_absent("lock", "a", Duration::from_millis(30))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_if_absent("lock", "b", Duration::from_millis(30))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            store
                .set_if_absent("lock", "b", Duration::from_millis(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_if_equals_requires_matching_token() {
        let store = MemoryStore::new();
        store
            .set_if_absent("lock", "token-a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("lock", "token-b").await.unwrap());
        assert!(store.delete_if_equals("lock", "token-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("seq").await.unwrap(), 1);
        assert_eq!(store.increment("seq").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn admit_decrements_stock_and_appends_exactly_once() {
        let store = MemoryStore::new();
        store
            .set(&stock_key(VoucherId::new(1)), "2", None)
            .await
            .unwrap();

        assert_eq!(
            store.admit(request(1, 10, 100), "orders").await.unwrap(),
            AdmissionStatus::Admitted
        );
        assert_eq!(
            store.admit(request(1, 10, 101), "orders").await.unwrap(),
            AdmissionStatus::Duplicate
        );
        assert_eq!(
            store.admit(request(1, 11, 102), "orders").await.unwrap(),
            AdmissionStatus::Admitted
        );
        assert_eq!(
            store.admit(request(1, 12, 103), "orders").await.unwrap(),
            AdmissionStatus::StockExhausted
        );

        // Only admitted attempts reach the stream.
        assert_eq!(store.stream_len("orders"), 2);
        assert_eq!(
            store
                .get(&stock_key(VoucherId::new(1)))
                .await
                .unwrap()
                .as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn admit_unseeded_voucher_is_stock_exhausted() {
        let store = MemoryStore::new();
        assert_eq!(
            store.admit(request(9, 1, 5), "orders").await.unwrap(),
            AdmissionStatus::StockExhausted
        );
    }

    #[tokio::test]
    async fn group_reads_deliver_then_replay_until_ack() {
        let store = MemoryStore::new();
        store
            .set(&stock_key(VoucherId::new(1)), "5", None)
            .await
            .unwrap();
        store.ensure_group("orders", "g1").await.unwrap();
        store.admit(request(1, 10, 100), "orders").await.unwrap();

        let entry = store
            .read_group("orders", "g1", "c1", ReadPosition::New, Duration::ZERO)
            .await
            .unwrap()
            .expect("delivers the appended entry");
        assert_eq!(entry.fields.get("id").map(String::as_str), Some("100"));

        // Unacknowledged: replay sees it, live reads do not.
        let replay = store
            .read_group("orders", "g1", "c1", ReadPosition::Pending, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(replay.as_ref().map(|e| e.id.as_str()), Some(entry.id.as_str()));
        assert!(
            store
                .read_group("orders", "g1", "c1", ReadPosition::New, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );

        store.ack("orders", "g1", &entry.id).await.unwrap();
        assert!(
            store
                .read_group("orders", "g1", "c1", ReadPosition::Pending, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store.ensure_group("orders", "g1").await.unwrap();

        let started = Instant::now();
        let none = store
            .read_group(
                "orders",
                "g1",
                "c1",
                ReadPosition::New,
                Duration::from_millis(25),
            )
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
