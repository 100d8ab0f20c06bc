//! Synchronous admission: the hot path of a flash sale.

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::application::repos::VouchersRepo;
use crate::cache::{CacheClient, CacheError, VOUCHER_NS};
use crate::domain::entities::SeckillVoucherRecord;
use crate::domain::error::DomainError;
use crate::domain::types::{OrderId, UserId, VoucherId};
use crate::id::{IdError, IdGenerator};
use crate::store::{AdmissionRequest, AdmissionStatus, SharedStore, StoreError, stock_key};

/// Id-generator prefix for flash-sale orders.
pub const ORDER_ID_PREFIX: &str = "order";

pub const METRIC_SECKILL_ADMITTED: &str = "scorta_seckill_admitted_total";
pub const METRIC_SECKILL_REJECTED: &str = "scorta_seckill_rejected_total";

#[derive(Debug, Error)]
pub enum SeckillError {
    #[error("voucher {0} does not exist")]
    VoucherNotFound(VoucherId),
    #[error("sale has not started yet")]
    SaleNotStarted,
    #[error("sale has ended")]
    SaleEnded,
    #[error("voucher stock is exhausted")]
    StockExhausted,
    #[error("user already holds an order for this voucher")]
    DuplicateOrder,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates purchase attempts and runs the atomic admission step.
///
/// Caller identity is an explicit argument; nothing here reads ambient
/// request state.
pub struct SeckillService {
    store: Arc<dyn SharedStore>,
    cache: Arc<CacheClient>,
    vouchers: Arc<dyn VouchersRepo>,
    ids: IdGenerator,
    stream: String,
}

impl SeckillService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        cache: Arc<CacheClient>,
        vouchers: Arc<dyn VouchersRepo>,
        stream: impl Into<String>,
    ) -> Self {
        let ids = IdGenerator::new(Arc::clone(&store));
        Self {
            store,
            cache,
            vouchers,
            ids,
            stream: stream.into(),
        }
    }

    /// Attempt a purchase for `user_id`. On admission the order id is final:
    /// the attempt sits on the durable stream and the persister will finalize
    /// it. Every rejection is side-effect free.
    pub async fn purchase(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<OrderId, SeckillError> {
        let vouchers = Arc::clone(&self.vouchers);
        let voucher = self
            .cache
            .read_through(&VOUCHER_NS, voucher_id, move || async move {
                vouchers.find_voucher(voucher_id).await
            })
            .await
            .map_err(cache_to_seckill)?
            .ok_or(SeckillError::VoucherNotFound(voucher_id))?;

        let now = OffsetDateTime::now_utc();
        if now < voucher.begin_at {
            counter!(METRIC_SECKILL_REJECTED, "reason" => "not_started").increment(1);
            return Err(SeckillError::SaleNotStarted);
        }
        if now > voucher.end_at {
            counter!(METRIC_SECKILL_REJECTED, "reason" => "ended").increment(1);
            return Err(SeckillError::SaleEnded);
        }

        let order_id = OrderId::new(self.ids.next_id(ORDER_ID_PREFIX).await?);
        let request = AdmissionRequest {
            voucher_id,
            user_id,
            order_id,
        };
        match self.store.admit(request, &self.stream).await? {
            AdmissionStatus::Admitted => {
                counter!(METRIC_SECKILL_ADMITTED).increment(1);
                debug!(%user_id, %voucher_id, %order_id, "purchase admitted");
                Ok(order_id)
            }
            AdmissionStatus::StockExhausted => {
                counter!(METRIC_SECKILL_REJECTED, "reason" => "stock").increment(1);
                Err(SeckillError::StockExhausted)
            }
            AdmissionStatus::Duplicate => {
                counter!(METRIC_SECKILL_REJECTED, "reason" => "duplicate").increment(1);
                Err(SeckillError::DuplicateOrder)
            }
        }
    }

    /// Put a voucher on sale: seed its stock counter on the shared store and
    /// warm the voucher cache so window checks never touch the database.
    pub async fn publish_voucher(
        &self,
        voucher: &SeckillVoucherRecord,
    ) -> Result<(), SeckillError> {
        if voucher.stock < 0 {
            return Err(DomainError::validation("stock", "must be non-negative").into());
        }
        if voucher.end_at <= voucher.begin_at {
            return Err(DomainError::validation("end_at", "sale window is empty").into());
        }

        self.store
            .set(
                &stock_key(voucher.voucher_id),
                &voucher.stock.to_string(),
                None,
            )
            .await?;
        self.cache
            .warm(&VOUCHER_NS, voucher.voucher_id, voucher)
            .await
            .map_err(cache_to_seckill)?;
        info!(voucher_id = %voucher.voucher_id, stock = voucher.stock, "voucher published");
        Ok(())
    }
}

/// Keep store failures from the cache layer under one variant.
fn cache_to_seckill(err: CacheError) -> SeckillError {
    match err {
        CacheError::Store(store) => SeckillError::Store(store),
        other => SeckillError::Cache(other),
    }
}
