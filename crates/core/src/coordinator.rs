//! Read-through resolution of a single token.
//!
//! A lookup is served from the cache when the cached price is still within its
//! TTL. Otherwise the store is consulted, and only what is missing or stale is
//! fetched from upstream: a known token only gets a new price, an unknown one
//! is resolved in full. Every successful resolution is written to the store
//! before it is cached.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::{
    address::TokenAddress,
    cache::TokenCache,
    database::TokenStore,
    error::Error,
    resolver::{ImageResolver, MetadataResolver, PriceResolver, ResolveError, RetryPolicy},
    token::TokenRecord,
};

pub struct Coordinator {
    cache: TokenCache,
    store: Arc<dyn TokenStore>,
    prices: Arc<dyn PriceResolver>,
    metadata: Arc<dyn MetadataResolver>,
    images: Option<Arc<dyn ImageResolver>>,
    price_ttl: TimeDelta,
    retry: RetryPolicy,
    in_flight: InFlight,
}

impl Coordinator {
    pub fn new(
        cache: TokenCache,
        store: Arc<dyn TokenStore>,
        prices: Arc<dyn PriceResolver>,
        metadata: Arc<dyn MetadataResolver>,
        price_ttl: TimeDelta,
    ) -> Self {
        Self {
            cache,
            store,
            prices,
            metadata,
            images: None,
            price_ttl,
            retry: RetryPolicy::default(),
            in_flight: InFlight::default(),
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageResolver>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves `raw` to a token record with a price no older than the TTL.
    #[instrument(skip(self))]
    pub async fn resolve(&self, raw: &str) -> Result<TokenRecord, Error> {
        let address = TokenAddress::parse(raw)?;

        if let Some(record) = self.cache.get(&address).await {
            if record.is_fresh(Utc::now(), self.price_ttl) {
                debug!(%address, "serving fresh token from cache");
                return Ok(record);
            }
        }

        let _guard = self.in_flight.acquire(address).await;

        // a concurrent caller may have finished while we waited
        let now = Utc::now();
        if let Some(record) = self.cache.get(&address).await {
            if record.is_fresh(now, self.price_ttl) {
                debug!(%address, "serving fresh token from cache");
                return Ok(record);
            }
            return self.refresh_price(record, now).await;
        }

        match self.store.get(&address).await? {
            Some(record) if record.is_fresh(now, self.price_ttl) => {
                debug!(%address, "serving fresh token from store");
                self.cache.put(record.clone()).await;
                Ok(record)
            }
            Some(record) => self.refresh_price(record, now).await,
            None => self.resolve_live(address, now).await,
        }
    }

    async fn refresh_price(
        &self,
        mut record: TokenRecord,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord, Error> {
        let address = record.address;
        let addresses = [address];
        let mut prices = self
            .retry
            .run("get_prices", || self.prices.get_prices(&addresses))
            .await
            .map_err(|err| Error::resolution(address, err))?;

        match prices.remove(&address) {
            Some(price) => record.observe_price(Some(price), now),
            None if record.price.is_some() => {
                return Err(Error::resolution(address, ResolveError::PriceUnavailable));
            }
            None => record.observe_price(None, now),
        }

        self.store.upsert(&record).await?;
        self.cache.put(record.clone()).await;

        info!(%address, price = ?record.price, "refreshed token price");
        Ok(record)
    }

    async fn resolve_live(
        &self,
        address: TokenAddress,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord, Error> {
        let addresses = [address];
        let (metadata, prices, image) = tokio::join!(
            self.retry
                .run("get_metadata", || self.metadata.get_metadata(&address)),
            self.retry
                .run("get_prices", || self.prices.get_prices(&addresses)),
            self.resolve_image(&address),
        );
        let metadata = metadata.map_err(|err| Error::resolution(address, err))?;
        let mut prices = prices.map_err(|err| Error::resolution(address, err))?;

        let mut record = TokenRecord::new(address, metadata, prices.remove(&address), now);
        record.image = image;

        self.store.upsert(&record).await?;
        self.cache.put(record.clone()).await;

        info!(%address, symbol = %record.symbol, price = ?record.price, "resolved new token");
        Ok(record)
    }

    async fn resolve_image(&self, address: &TokenAddress) -> Option<String> {
        let images = self.images.as_ref()?;
        match self.retry.run("get_image", || images.get_image(address)).await {
            Ok(image) => image,
            Err(err) => {
                warn!(%address, error = %err, "failed to resolve token image");
                None
            }
        }
    }
}

/// One lock per address currently being resolved. An entry lives exactly as
/// long as someone holds or waits on its lock.
#[derive(Debug, Default)]
struct InFlight {
    locks: Mutex<HashMap<TokenAddress, Arc<AsyncMutex<()>>>>,
}

impl InFlight {
    async fn acquire(&self, address: TokenAddress) -> InFlightGuard<'_> {
        let lock = Arc::clone(self.locks().entry(address).or_default());
        let guard = lock.lock_owned().await;
        InFlightGuard {
            in_flight: self,
            address,
            guard: Some(guard),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<TokenAddress, Arc<AsyncMutex<()>>>> {
        // the map holds no invariant a panicking holder could break
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks().len()
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    address: TokenAddress,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // release our reference before counting the remaining ones
        drop(self.guard.take());

        let mut locks = self.in_flight.locks();
        let idle = locks
            .get(&self.address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.address);
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("cache", &self.cache)
            .field("price_ttl", &self.price_ttl)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
