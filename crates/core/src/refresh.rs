//! Periodic price refresh of the stalest stored tokens.
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::TokenCache,
    database::TokenStore,
    error::Error,
    resolver::{PriceResolver, RetryPolicy},
    token::TokenRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another run was still in progress.
    Skipped,
    Completed(RefreshSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Records picked for this run
    pub selected: usize,
    /// Records that received a new price
    pub updated: usize,
}

/// Refreshes the prices of the `batch_size` least recently updated tokens
/// with a single upstream call, committing all updates in one transaction.
pub struct BulkRefresher {
    cache: TokenCache,
    store: Arc<dyn TokenStore>,
    prices: Arc<dyn PriceResolver>,
    batch_size: usize,
    retry: RetryPolicy,
    running: Mutex<()>,
}

impl BulkRefresher {
    pub fn new(
        cache: TokenCache,
        store: Arc<dyn TokenStore>,
        prices: Arc<dyn PriceResolver>,
        batch_size: usize,
    ) -> Self {
        Self {
            cache,
            store,
            prices,
            batch_size,
            retry: RetryPolicy::default(),
            running: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Performs one run unless another one is still in progress.
    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn run_once(&self) -> Result<RefreshOutcome, Error> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous refresh run still in progress, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let selected = self.store.oldest(self.batch_size).await?;
        if selected.is_empty() {
            debug!("no tokens to refresh");
            return Ok(RefreshOutcome::Completed(RefreshSummary::default()));
        }

        let addresses: Vec<_> = selected.iter().map(|record| record.address).collect();
        let mut prices = self
            .retry
            .run("get_prices", || self.prices.get_prices(&addresses))
            .await
            .map_err(|source| Error::BatchResolution {
                count: addresses.len(),
                source,
            })?;

        let now = Utc::now();
        let updated: Vec<TokenRecord> = selected
            .iter()
            .filter_map(|record| {
                let price = prices.remove(&record.address)?;
                let mut record = record.clone();
                record.observe_price(Some(price), now);
                Some(record)
            })
            .collect();

        let summary = RefreshSummary {
            selected: selected.len(),
            updated: updated.len(),
        };
        if updated.is_empty() {
            info!(selected = summary.selected, "no prices returned for refresh batch");
            return Ok(RefreshOutcome::Completed(summary));
        }

        self.store.upsert_batch(&updated).await?;
        for record in updated {
            self.cache.put(record).await;
        }

        info!(
            selected = summary.selected,
            updated = summary.updated,
            "refreshed token prices"
        );
        Ok(RefreshOutcome::Completed(summary))
    }
}

impl std::fmt::Debug for BulkRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkRefresher")
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, str::FromStr as _, time::Duration};

    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use chrono::{DateTime, TimeDelta};
    use reqwest::StatusCode;

    use super::*;
    use crate::{
        address::TokenAddress,
        resolver::{MockPriceResolver, ResolveError},
        testing::InMemoryStore,
        token::TokenMetadata,
    };

    fn token(n: u8, last_updated: DateTime<Utc>) -> TokenRecord {
        TokenRecord::new(
            TokenAddress::parse(&format!("0x{:040x}", n)).unwrap(),
            TokenMetadata {
                name: format!("Token {n}"),
                symbol: format!("T{n}"),
                decimals: 18,
            },
            Some(BigDecimal::from(n)),
            last_updated,
        )
    }

    fn price(raw: &str) -> BigDecimal {
        BigDecimal::from_str(raw).unwrap()
    }

    /// Three records with t1 < t2 < t3
    fn fixture() -> (TokenRecord, TokenRecord, TokenRecord) {
        let now = Utc::now();
        (
            token(1, now - TimeDelta::hours(3)),
            token(2, now - TimeDelta::hours(2)),
            token(3, now - TimeDelta::hours(1)),
        )
    }

    fn refresher(store: Arc<InMemoryStore>, prices: impl PriceResolver + 'static) -> (BulkRefresher, TokenCache) {
        let cache = TokenCache::new(100);
        let refresher = BulkRefresher::new(cache.clone(), store, Arc::new(prices), 2).with_retry(
            RetryPolicy {
                timeout: Duration::from_secs(1),
                backoff: Duration::from_millis(1),
            },
        );
        (refresher, cache)
    }

    #[tokio::test]
    async fn test_refreshes_oldest_records_with_one_call() {
        let (t1, t2, t3) = fixture();
        let store = Arc::new(InMemoryStore::with_records([t1.clone(), t2.clone(), t3.clone()]));
        let (a1, a2) = (t1.address, t2.address);
        let mut prices = MockPriceResolver::new();
        prices
            .expect_get_prices()
            .withf(move |addresses| addresses.len() == 2 && addresses.contains(&a1) && addresses.contains(&a2))
            .times(1)
            .returning(move |_| Ok(HashMap::from([(a1, price("11.5"))])));
        let (refresher, cache) = refresher(Arc::clone(&store), prices);

        let outcome = refresher.run_once().await.unwrap();

        assert_eq!(
            outcome,
            RefreshOutcome::Completed(RefreshSummary {
                selected: 2,
                updated: 1
            })
        );
        let refreshed = store.record(&t1.address).unwrap();
        assert_eq!(refreshed.price, Some(price("11.5")));
        assert!(refreshed.last_updated > t1.last_updated);
        assert_eq!(refreshed.name, t1.name);
        assert_eq!(store.record(&t2.address), Some(t2.clone()));
        assert_eq!(store.record(&t3.address), Some(t3));
        assert_eq!(cache.get(&t1.address).await, Some(refreshed));
        assert_eq!(cache.get(&t2.address).await, None);
        assert_eq!(store.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_unpriced_record_is_selected_again() {
        let (t1, t2, t3) = fixture();
        let store = Arc::new(InMemoryStore::with_records([t1.clone(), t2.clone(), t3]));
        let a1 = t1.address;
        let mut prices = MockPriceResolver::new();
        prices
            .expect_get_prices()
            .times(2)
            .returning(move |_| Ok(HashMap::from([(a1, price("1"))])));
        let (refresher, _) = refresher(Arc::clone(&store), prices);

        refresher.run_once().await.unwrap();
        let next = store.oldest(2).await.unwrap();

        assert_eq!(next[0].address, t2.address);
        refresher.run_once().await.unwrap();
        assert_eq!(store.record(&t2.address), Some(t2));
    }

    #[tokio::test]
    async fn test_failed_transaction_modifies_nothing() {
        let (t1, t2, t3) = fixture();
        let store = Arc::new(InMemoryStore::with_records([t1.clone(), t2.clone(), t3]));
        store.fail_batches(true);
        let (a1, a2) = (t1.address, t2.address);
        let mut prices = MockPriceResolver::new();
        prices
            .expect_get_prices()
            .times(1)
            .returning(move |_| Ok(HashMap::from([(a1, price("2")), (a2, price("3"))])));
        let (refresher, cache) = refresher(Arc::clone(&store), prices);

        let err = refresher.run_once().await.unwrap_err();

        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(store.record(&t1.address), Some(t1.clone()));
        assert_eq!(store.record(&t2.address), Some(t2));
        assert_eq!(cache.get(&t1.address).await, None);
    }

    #[tokio::test]
    async fn test_price_failure_is_a_batch_error() {
        let (t1, t2, t3) = fixture();
        let store = Arc::new(InMemoryStore::with_records([t1.clone(), t2, t3]));
        let mut prices = MockPriceResolver::new();
        prices
            .expect_get_prices()
            .times(1)
            .returning(|_| Err(ResolveError::Status(StatusCode::UNAUTHORIZED)));
        let (refresher, _) = refresher(Arc::clone(&store), prices);

        let err = refresher.run_once().await.unwrap_err();

        assert!(matches!(err, Error::BatchResolution { count: 2, .. }));
        assert_eq!(store.record(&t1.address), Some(t1));
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_store_makes_no_calls() {
        let store = Arc::new(InMemoryStore::new());
        let (refresher, _) = refresher(Arc::clone(&store), MockPriceResolver::new());

        let outcome = refresher.run_once().await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Completed(RefreshSummary::default()));
    }

    struct SlowPrices;

    #[async_trait]
    impl PriceResolver for SlowPrices {
        async fn get_prices(
            &self,
            _: &[TokenAddress],
        ) -> Result<HashMap<TokenAddress, BigDecimal>, ResolveError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HashMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_is_skipped() {
        let (t1, t2, t3) = fixture();
        let store = Arc::new(InMemoryStore::with_records([t1, t2, t3]));
        let (refresher, _) = refresher(Arc::clone(&store), SlowPrices);

        let (first, second) = tokio::join!(refresher.run_once(), refresher.run_once());

        assert_eq!(
            first.unwrap(),
            RefreshOutcome::Completed(RefreshSummary {
                selected: 2,
                updated: 0
            })
        );
        assert_eq!(second.unwrap(), RefreshOutcome::Skipped);
    }
}
