//! Asynchronous order finalization off the durable admission stream.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::repos::{FinalizeOutcome, OrdersRepo, RepoError};
use crate::domain::entities::VoucherOrderRecord;
use crate::domain::types::UserId;
use crate::lock::{LockError, LockManager};
use crate::store::{ReadPosition, SharedStore, StoreError, StreamEntry};

use super::record::AdmissionRecord;

pub const METRIC_ORDERS_FINALIZED: &str = "scorta_orders_finalized_total";
pub const METRIC_PERSISTER_POISON: &str = "scorta_persister_poison_total";

/// Delay before retrying after a failed pending replay, so a broken backend
/// does not spin the consumer loop.
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PersisterError {
    #[error("another worker holds the order lock for user {user_id}")]
    UserBusy { user_id: UserId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Consumer-loop tunables. One fixed consumer per deployment.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Block duration of an empty fresh read.
    pub block: Duration,
    /// Lease TTL of the per-user finalization lock.
    pub lock_ttl: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            stream: "stream.orders".to_string(),
            group: "g1".to_string(),
            consumer: "c1".to_string(),
            block: Duration::from_secs(2),
            lock_ttl: Duration::from_secs(10),
        }
    }
}

/// Consumes admitted orders and finalizes them against the relational store.
///
/// Entries are acknowledged only after a terminal outcome, so a crash at any
/// point leaves the entry pending and the next run replays it; the finalize
/// transaction is idempotent, so a replay of an already-finalized order is a
/// no-op.
pub struct OrderPersister {
    store: Arc<dyn SharedStore>,
    orders: Arc<dyn OrdersRepo>,
    locks: LockManager,
    config: PersisterConfig,
}

impl OrderPersister {
    pub fn new(
        store: Arc<dyn SharedStore>,
        orders: Arc<dyn OrdersRepo>,
        config: PersisterConfig,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&store));
        Self {
            store,
            orders,
            locks,
            config,
        }
    }

    /// Consumer loop. Replays this consumer's pending entries first, then
    /// processes fresh deliveries until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self
            .store
            .ensure_group(&self.config.stream, &self.config.group)
            .await
        {
            warn!(error = %err, stream = %self.config.stream, "failed to ensure consumer group");
        }
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "order persister started"
        );

        self.drain_pending(&mut shutdown).await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                stepped = self.step(ReadPosition::New) => {
                    if let Err(err) = stepped {
                        warn!(error = %err, "finalization failed, switching to pending replay");
                        self.drain_pending(&mut shutdown).await;
                    }
                }
            }
        }
        info!("order persister stopped");
    }

    /// Read one entry at `position` and finalize it. `Ok(false)` means there
    /// was nothing to read. Errors leave the entry pending for replay.
    pub async fn step(&self, position: ReadPosition) -> Result<bool, PersisterError> {
        let entry = self
            .store
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                position,
                self.config.block,
            )
            .await?;
        match entry {
            Some(entry) => {
                self.handle(entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replay pending entries until none remain. Used at startup and after a
    /// fresh-delivery failure.
    pub async fn recover(&self) -> Result<(), PersisterError> {
        while self.step(ReadPosition::Pending).await? {}
        Ok(())
    }

    async fn drain_pending(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.step(ReadPosition::Pending).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!(error = %err, "pending replay failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn handle(&self, entry: StreamEntry) -> Result<(), PersisterError> {
        let record = match AdmissionRecord::from_entry(&entry) {
            Ok(record) => record,
            Err(err) => {
                // Poison entry: it can never finalize, so acknowledge it out
                // of the pending list instead of replaying it forever.
                warn!(entry_id = %entry.id, error = %err, "dropping malformed stream entry");
                counter!(METRIC_PERSISTER_POISON).increment(1);
                self.ack(&entry.id).await?;
                return Ok(());
            }
        };

        let lock_key = format!("lock:order:{}", record.user_id);
        let Some(lease) = self.locks.try_acquire(&lock_key, self.config.lock_ttl).await? else {
            // Entry stays pending; the replay path retries once the other
            // holder is done.
            return Err(PersisterError::UserBusy {
                user_id: record.user_id,
            });
        };

        let order = VoucherOrderRecord {
            id: record.order_id,
            voucher_id: record.voucher_id,
            user_id: record.user_id,
            created_at: OffsetDateTime::now_utc(),
        };
        let outcome = self.orders.finalize_order(&order).await;
        if let Err(err) = self.locks.release(lease).await {
            warn!(key = %lock_key, error = %err, "failed to release order lock");
        }

        match outcome? {
            FinalizeOutcome::Created => {
                counter!(METRIC_ORDERS_FINALIZED).increment(1);
                info!(order_id = %order.id, user_id = %order.user_id, "order finalized");
            }
            FinalizeOutcome::AlreadyExists => {
                debug!(order_id = %order.id, "order already finalized, replay ignored");
            }
            FinalizeOutcome::StockExhausted => {
                // Admission only lets stock-many entries through, so this
                // means the relational stock diverged from the counter.
                warn!(
                    order_id = %order.id,
                    voucher_id = %order.voucher_id,
                    "no relational stock left for an admitted order"
                );
            }
        }
        self.ack(&entry.id).await?;
        Ok(())
    }

    async fn ack(&self, entry_id: &str) -> Result<(), StoreError> {
        self.store
            .ack(&self.config.stream, &self.config.group, entry_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::types::{OrderId, VoucherId};
    use crate::store::{AdmissionRequest, AdmissionStatus, MemoryStore, stock_key};

    fn config() -> PersisterConfig {
        PersisterConfig {
            block: Duration::from_millis(20),
            ..PersisterConfig::default()
        }
    }

    /// In-memory stand-in for the relational store, with the same
    /// idempotency contract as the SQL transaction.
    #[derive(Default)]
    struct FakeOrders {
        rows: Mutex<HashMap<(VoucherId, UserId), VoucherOrderRecord>>,
        stock: Mutex<HashMap<VoucherId, i32>>,
        fail_next: AtomicUsize,
    }

    impl FakeOrders {
        fn with_stock(voucher_id: VoucherId, stock: i32) -> Self {
            let fake = Self::default();
            fake.stock.lock().unwrap().insert(voucher_id, stock);
            fake
        }

        fn order_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrdersRepo for FakeOrders {
        async fn find_order(
            &self,
            voucher_id: VoucherId,
            user_id: UserId,
        ) -> Result<Option<VoucherOrderRecord>, RepoError> {
            Ok(self.rows.lock().unwrap().get(&(voucher_id, user_id)).cloned())
        }

        async fn finalize_order(
            &self,
            order: &VoucherOrderRecord,
        ) -> Result<FinalizeOutcome, RepoError> {
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RepoError::Timeout);
            }
            let mut rows = self.rows.lock().unwrap();
            let key = (order.voucher_id, order.user_id);
            if rows.contains_key(&key) {
                return Ok(FinalizeOutcome::AlreadyExists);
            }
            let mut stock = self.stock.lock().unwrap();
            let remaining = stock.entry(order.voucher_id).or_insert(0);
            if *remaining <= 0 {
                return Ok(FinalizeOutcome::StockExhausted);
            }
            *remaining -= 1;
            rows.insert(key, order.clone());
            Ok(FinalizeOutcome::Created)
        }
    }

    async fn seed_admission(store: &MemoryStore, cfg: &PersisterConfig, user: u64, order: u64) {
        store
            .set(&stock_key(VoucherId::new(7)), "10", None)
            .await
            .unwrap();
        let status = store
            .admit(
                AdmissionRequest {
                    voucher_id: VoucherId::new(7),
                    user_id: UserId::new(user),
                    order_id: OrderId::new(order),
                },
                &cfg.stream,
            )
            .await
            .unwrap();
        assert_eq!(status, AdmissionStatus::Admitted);
    }

    #[tokio::test]
    async fn finalizes_an_admitted_entry_and_acks_it() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::with_stock(VoucherId::new(7), 10));
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        seed_admission(&store, &cfg, 1001, 42).await;

        let persister =
            OrderPersister::new(store.clone(), orders.clone() as Arc<dyn OrdersRepo>, cfg.clone());
        assert!(persister.step(ReadPosition::New).await.unwrap());
        assert_eq!(orders.order_count(), 1);
        assert!(store.pending_ids(&cfg.stream, &cfg.group).is_empty());

        let order = orders
            .find_order(VoucherId::new(7), UserId::new(1001))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.id, OrderId::new(42));
    }

    #[tokio::test]
    async fn empty_stream_times_out_without_error() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        let persister = OrderPersister::new(
            store.clone(),
            Arc::new(FakeOrders::default()) as Arc<dyn OrdersRepo>,
            cfg,
        );
        assert!(!persister.step(ReadPosition::New).await.unwrap());
    }

    #[tokio::test]
    async fn failed_finalize_stays_pending_and_replays_once() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::with_stock(VoucherId::new(7), 10));
        orders.fail_next.store(1, Ordering::SeqCst);
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        seed_admission(&store, &cfg, 1001, 42).await;

        let persister =
            OrderPersister::new(store.clone(), orders.clone() as Arc<dyn OrdersRepo>, cfg.clone());
        let err = persister.step(ReadPosition::New).await.unwrap_err();
        assert!(matches!(err, PersisterError::Repo(RepoError::Timeout)));
        assert_eq!(store.pending_ids(&cfg.stream, &cfg.group).len(), 1);
        assert_eq!(orders.order_count(), 0);

        persister.recover().await.unwrap();
        assert_eq!(orders.order_count(), 1);
        assert!(store.pending_ids(&cfg.stream, &cfg.group).is_empty());
    }

    #[tokio::test]
    async fn replay_of_a_finalized_order_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::with_stock(VoucherId::new(7), 10));
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        seed_admission(&store, &cfg, 1001, 42).await;

        let persister =
            OrderPersister::new(store.clone(), orders.clone() as Arc<dyn OrdersRepo>, cfg.clone());
        assert!(persister.step(ReadPosition::New).await.unwrap());

        // A second admission record for the same (voucher, user) models a
        // redelivered entry; finalize must not create a second order.
        seed_admission(&store, &cfg, 1001, 43).await;
        assert!(persister.step(ReadPosition::New).await.unwrap());
        assert_eq!(orders.order_count(), 1);
        assert!(store.pending_ids(&cfg.stream, &cfg.group).is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_acked_not_replayed() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::default());
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        store.append_raw(
            &cfg.stream,
            HashMap::from([("garbage".to_string(), "1".to_string())]),
        );

        let persister =
            OrderPersister::new(store.clone(), orders.clone() as Arc<dyn OrdersRepo>, cfg.clone());
        assert!(persister.step(ReadPosition::New).await.unwrap());
        assert_eq!(orders.order_count(), 0);
        assert!(store.pending_ids(&cfg.stream, &cfg.group).is_empty());
    }

    #[tokio::test]
    async fn held_user_lock_defers_the_entry() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::with_stock(VoucherId::new(7), 10));
        store.ensure_group(&cfg.stream, &cfg.group).await.unwrap();
        seed_admission(&store, &cfg, 1001, 42).await;

        let locks = LockManager::new(store.clone() as Arc<dyn SharedStore>);
        let lease = locks
            .try_acquire("lock:order:1001", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let persister =
            OrderPersister::new(store.clone(), orders.clone() as Arc<dyn OrdersRepo>, cfg.clone());
        let err = persister.step(ReadPosition::New).await.unwrap_err();
        assert!(matches!(err, PersisterError::UserBusy { .. }));
        assert_eq!(store.pending_ids(&cfg.stream, &cfg.group).len(), 1);

        locks.release(lease).await.unwrap();
        persister.recover().await.unwrap();
        assert_eq!(orders.order_count(), 1);
    }

    #[tokio::test]
    async fn run_processes_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let orders = Arc::new(FakeOrders::with_stock(VoucherId::new(7), 10));
        seed_admission(&store, &cfg, 1001, 42).await;
        seed_admission(&store, &cfg, 1002, 43).await;

        let persister = Arc::new(OrderPersister::new(
            store.clone(),
            orders.clone() as Arc<dyn OrdersRepo>,
            cfg.clone(),
        ));
        let (stop, shutdown) = watch::channel(false);
        let worker = {
            let persister = Arc::clone(&persister);
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(orders.order_count(), 2);
        assert!(store.pending_ids(&cfg.stream, &cfg.group).is_empty());
    }
}
