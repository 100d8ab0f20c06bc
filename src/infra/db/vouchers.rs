use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{RepoError, VouchersRepo};
use crate::domain::entities::SeckillVoucherRecord;
use crate::domain::types::VoucherId;

use super::{PostgresRepositories, id_to_db, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct VoucherRow {
    voucher_id: i64,
    stock: i32,
    begin_at: OffsetDateTime,
    end_at: OffsetDateTime,
}

impl From<VoucherRow> for SeckillVoucherRecord {
    fn from(row: VoucherRow) -> Self {
        Self {
            voucher_id: VoucherId::new(row.voucher_id as u64),
            stock: row.stock,
            begin_at: row.begin_at,
            end_at: row.end_at,
        }
    }
}

#[async_trait]
impl VouchersRepo for PostgresRepositories {
    async fn find_voucher(
        &self,
        voucher_id: VoucherId,
    ) -> Result<Option<SeckillVoucherRecord>, RepoError> {
        let row: Option<VoucherRow> = sqlx::query_as(
            "SELECT voucher_id, stock, begin_at, end_at \
             FROM seckill_vouchers WHERE voucher_id = $1",
        )
        .bind(id_to_db(voucher_id.get(), "voucher_id")?)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }
}
