use async_trait::async_trait;

use crate::application::repos::{RepoError, ShopsRepo};
use crate::domain::entities::ShopRecord;
use crate::domain::types::ShopId;

use super::{PostgresRepositories, id_to_db, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct ShopRow {
    id: i64,
    name: String,
    address: String,
    avg_price: i64,
    score: i32,
}

impl From<ShopRow> for ShopRecord {
    fn from(row: ShopRow) -> Self {
        Self {
            id: ShopId::new(row.id as u64),
            name: row.name,
            address: row.address,
            avg_price: row.avg_price,
            score: row.score,
        }
    }
}

#[async_trait]
impl ShopsRepo for PostgresRepositories {
    async fn find_shop(&self, shop_id: ShopId) -> Result<Option<ShopRecord>, RepoError> {
        let row: Option<ShopRow> = sqlx::query_as(
            "SELECT id, name, address, avg_price, score FROM shops WHERE id = $1",
        )
        .bind(id_to_db(shop_id.get(), "shop_id")?)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }
}
