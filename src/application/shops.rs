//! Shop lookup service, the cache engine's first consumer.

use std::sync::Arc;

use crate::application::error::AppError;
use crate::application::repos::ShopsRepo;
use crate::cache::{CacheClient, SHOP_NS};
use crate::domain::entities::ShopRecord;
use crate::domain::error::DomainError;
use crate::domain::types::ShopId;

pub struct ShopService {
    cache: Arc<CacheClient>,
    shops: Arc<dyn ShopsRepo>,
}

impl ShopService {
    pub fn new(cache: Arc<CacheClient>, shops: Arc<dyn ShopsRepo>) -> Self {
        Self { cache, shops }
    }

    /// Look up a shop through the lock-based cache variant: concurrent misses
    /// on a hot shop serialize behind a per-shop lock and load once.
    pub async fn get_shop(&self, shop_id: ShopId) -> Result<Option<ShopRecord>, AppError> {
        let shops = Arc::clone(&self.shops);
        let shop = self
            .cache
            .read_with_lock(&SHOP_NS, shop_id, move || async move {
                shops.find_shop(shop_id).await
            })
            .await?;
        Ok(shop)
    }

    /// Look up a shop through the logical-expiration variant. Only useful for
    /// shops warmed with [`ShopService::warm_shop`]; unwarmed shops read as
    /// absent.
    pub async fn get_shop_logical(&self, shop_id: ShopId) -> Result<Option<ShopRecord>, AppError> {
        let shops = Arc::clone(&self.shops);
        let shop = self
            .cache
            .read_with_logical_expire(&SHOP_NS, shop_id, move || async move {
                shops.find_shop(shop_id).await
            })
            .await?;
        Ok(shop)
    }

    /// Preload one shop as a logical-expiration entry, typically before a
    /// traffic spike on its page.
    pub async fn warm_shop(&self, shop_id: ShopId) -> Result<(), AppError> {
        let shop = self
            .shops
            .find_shop(shop_id)
            .await?
            .ok_or_else(|| DomainError::validation("shop_id", "no such shop"))?;
        self.cache.warm_logical(&SHOP_NS, shop_id, &shop).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::repos::RepoError;
    use crate::cache::CacheConfig;
    use crate::store::MemoryStore;

    struct FakeShops {
        rows: HashMap<ShopId, ShopRecord>,
        lookups: AtomicUsize,
    }

    impl FakeShops {
        fn with(rows: Vec<ShopRecord>) -> Self {
            Self {
                rows: rows.into_iter().map(|shop| (shop.id, shop)).collect(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ShopsRepo for FakeShops {
        async fn find_shop(&self, shop_id: ShopId) -> Result<Option<ShopRecord>, RepoError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.get(&shop_id).cloned())
        }
    }

    fn shop(id: u64) -> ShopRecord {
        ShopRecord {
            id: ShopId::new(id),
            name: format!("Shop {id}"),
            address: "2 Demo Street".to_string(),
            avg_price: 50,
            score: 40,
        }
    }

    fn service(rows: Vec<ShopRecord>) -> (Arc<FakeShops>, ShopService) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheClient::new(store, CacheConfig::default()));
        let shops = Arc::new(FakeShops::with(rows));
        let service = ShopService::new(cache, shops.clone() as Arc<dyn ShopsRepo>);
        (shops, service)
    }

    #[tokio::test]
    async fn get_shop_caches_the_row() {
        let (shops, service) = service(vec![shop(1)]);

        for _ in 0..3 {
            let got = service.get_shop(ShopId::new(1)).await.unwrap();
            assert_eq!(got.unwrap().name, "Shop 1");
        }
        assert_eq!(shops.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_shop_reads_as_none() {
        let (_, service) = service(vec![]);
        assert!(service.get_shop(ShopId::new(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn warm_then_logical_read_skips_the_repo() {
        let (shops, service) = service(vec![shop(2)]);
        service.warm_shop(ShopId::new(2)).await.unwrap();
        let warming_lookups = shops.lookups.load(Ordering::SeqCst);

        let got = service.get_shop_logical(ShopId::new(2)).await.unwrap();
        assert_eq!(got.unwrap().name, "Shop 2");
        assert_eq!(shops.lookups.load(Ordering::SeqCst), warming_lookups);
    }

    #[tokio::test]
    async fn warming_an_unknown_shop_is_an_error() {
        let (_, service) = service(vec![]);
        let err = service.warm_shop(ShopId::new(3)).await.unwrap_err();
        assert!(matches!(err, AppError::Domain(_)));
    }
}
