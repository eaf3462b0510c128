//! In-memory collaborators for exercising the coordinator, the refresher and
//! the HTTP surface without Postgres or network access.
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::{
    address::TokenAddress,
    database::{StoreError, TokenStore},
    resolver::{ImageResolver, MetadataResolver, PriceResolver, ResolveError},
    token::{TokenMetadata, TokenRecord},
};

/// `TokenStore` backed by a map, with call counters and failure injection.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<TokenAddress, TokenRecord>>,
    fail_writes: AtomicBool,
    fail_batches: AtomicBool,
    gets: AtomicUsize,
    upserts: AtomicUsize,
    batches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = TokenRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Writes a record directly, bypassing counters and failure injection.
    pub fn insert(&self, record: TokenRecord) {
        self.lock().insert(record.address, record);
    }

    pub fn record(&self, address: &TokenAddress) -> Option<TokenRecord> {
        self.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Makes every subsequent `upsert` and `upsert_batch` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `upsert_batch` fail before applying anything.
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TokenAddress, TokenRecord>> {
        // a poisoned map is still a consistent map for test purposes
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TokenStore for InMemoryStore {
    async fn get(&self, address: &TokenAddress) -> Result<Option<TokenRecord>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.record(address))
    }

    async fn upsert(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sql(sqlx::Error::PoolTimedOut));
        }

        let mut records = self.lock();
        let image = records
            .get(&record.address)
            .and_then(|existing| existing.image.clone());
        let mut record = record.clone();
        record.image = record.image.or(image);
        records.insert(record.address, record);
        Ok(())
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<TokenRecord>, StoreError> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by_key(|record| record.last_updated);
        records.truncate(limit);
        Ok(records)
    }

    async fn upsert_batch(&self, records: &[TokenRecord]) -> Result<(), StoreError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sql(sqlx::Error::PoolTimedOut));
        }

        let mut stored = self.lock();
        for record in records {
            stored.insert(record.address, record.clone());
        }
        Ok(())
    }
}

/// Resolver serving fixed answers for all three upstream traits.
///
/// Unknown addresses have no price and fail metadata lookup with a
/// non-transient contract error.
#[derive(Debug, Default)]
pub struct StaticResolver {
    prices: Mutex<HashMap<TokenAddress, BigDecimal>>,
    metadata: HashMap<TokenAddress, TokenMetadata>,
    images: HashMap<TokenAddress, String>,
    unavailable: AtomicBool,
    price_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        address: TokenAddress,
        metadata: TokenMetadata,
        price: Option<BigDecimal>,
    ) -> Self {
        self.metadata.insert(address, metadata);
        if let Some(price) = price {
            self.set_price(address, price);
        }
        self
    }

    pub fn with_image(mut self, address: TokenAddress, url: impl Into<String>) -> Self {
        self.images.insert(address, url.into());
        self
    }

    pub fn set_price(&self, address: TokenAddress, price: BigDecimal) {
        self.prices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address, price);
    }

    /// Makes every lookup fail with a 503 from the upstream.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ResolveError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ResolveError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PriceResolver for StaticResolver {
    async fn get_prices(
        &self,
        addresses: &[TokenAddress],
    ) -> Result<HashMap<TokenAddress, BigDecimal>, ResolveError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let prices = self
            .prices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(addresses
            .iter()
            .filter_map(|address| prices.get(address).map(|price| (*address, price.clone())))
            .collect())
    }
}

#[async_trait]
impl MetadataResolver for StaticResolver {
    async fn get_metadata(&self, address: &TokenAddress) -> Result<TokenMetadata, ResolveError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.metadata
            .get(address)
            .cloned()
            .ok_or_else(|| ResolveError::Contract("execution reverted".to_string()))
    }
}

#[async_trait]
impl ImageResolver for StaticResolver {
    async fn get_image(&self, address: &TokenAddress) -> Result<Option<String>, ResolveError> {
        self.check_available()?;
        Ok(self.images.get(address).cloned())
    }
}
