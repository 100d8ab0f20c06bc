//! Bounded background pool for cache rebuild tasks.
//!
//! A fixed set of workers drains a bounded queue of rebuild futures. The
//! queue is reserved before a job is built, so callers that cannot get a slot
//! keep ownership of whatever the job would have captured (in particular the
//! rebuild lock lease) and can fall back to serving stale.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

pub const METRIC_REBUILD_COMPLETED: &str = "scorta_cache_rebuild_completed_total";

/// A queued rebuild: load from the backing store, rewrite the entry, release
/// the rebuild lock. Errors are handled inside the future.
pub type RebuildJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A reserved queue slot. Submitting cannot fail.
pub struct RebuildSlot<'a> {
    permit: mpsc::Permit<'a, RebuildJob>,
}

impl RebuildSlot<'_> {
    pub fn submit(self, job: RebuildJob) {
        self.permit.send(job);
    }
}

/// Fixed-size worker pool with a bounded backlog.
pub struct RebuildPool {
    tx: mpsc::Sender<RebuildJob>,
}

impl RebuildPool {
    /// Spawn `workers` consumer tasks sharing a queue of `queue` slots.
    /// Requires a running tokio runtime.
    pub fn new(workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RebuildJob>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            job.await;
                            counter!(METRIC_REBUILD_COMPLETED).increment(1);
                        }
                        None => {
                            debug!(worker, "rebuild queue closed, worker exiting");
                            break;
                        }
                    }
                }
            });
        }

        Self { tx }
    }

    /// Reserve a queue slot, or `None` when the backlog is full.
    pub fn try_begin(&self) -> Option<RebuildSlot<'_>> {
        self.tx.try_reserve().ok().map(|permit| RebuildSlot { permit })
    }
}
