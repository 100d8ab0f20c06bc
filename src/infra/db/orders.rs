use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use crate::application::repos::{FinalizeOutcome, OrdersRepo, RepoError};
use crate::domain::entities::VoucherOrderRecord;
use crate::domain::types::{OrderId, UserId, VoucherId};

use super::{PostgresRepositories, id_to_db, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    voucher_id: i64,
    user_id: i64,
    created_at: OffsetDateTime,
}

impl From<OrderRow> for VoucherOrderRecord {
    fn from(row: OrderRow) -> Self {
        Self {
            id: OrderId::new(row.id as u64),
            voucher_id: VoucherId::new(row.voucher_id as u64),
            user_id: UserId::new(row.user_id as u64),
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl OrdersRepo for PostgresRepositories {
    async fn find_order(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<Option<VoucherOrderRecord>, RepoError> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT id, voucher_id, user_id, created_at \
             FROM voucher_orders WHERE voucher_id = $1 AND user_id = $2",
        )
        .bind(id_to_db(voucher_id.get(), "voucher_id")?)
        .bind(id_to_db(user_id.get(), "user_id")?)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }

    async fn finalize_order(
        &self,
        order: &VoucherOrderRecord,
    ) -> Result<FinalizeOutcome, RepoError> {
        let voucher_id = id_to_db(order.voucher_id.get(), "voucher_id")?;
        let user_id = id_to_db(order.user_id.get(), "user_id")?;
        let order_id = id_to_db(order.id.get(), "order_id")?;

        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM voucher_orders WHERE voucher_id = $1 AND user_id = $2",
        )
        .bind(voucher_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if existing.is_some() {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(FinalizeOutcome::AlreadyExists);
        }

        let decremented = sqlx::query(
            "UPDATE seckill_vouchers SET stock = stock - 1 \
             WHERE voucher_id = $1 AND stock > 0",
        )
        .bind(voucher_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if decremented.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(FinalizeOutcome::StockExhausted);
        }

        let inserted = sqlx::query(
            "INSERT INTO voucher_orders (id, voucher_id, user_id, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(order_id)
        .bind(voucher_id)
        .bind(user_id)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) => {
                tx.rollback().await.ok();
                return match map_sqlx_error(err) {
                    // Lost a race with another finalizer; their write stands.
                    RepoError::Duplicate { constraint } => {
                        debug!(order_id, constraint = %constraint, "order insert lost a finalize race");
                        Ok(FinalizeOutcome::AlreadyExists)
                    }
                    other => Err(other),
                };
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(FinalizeOutcome::Created)
    }
}
