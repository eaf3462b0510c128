use moka::future::Cache;
use tracing::trace;

use crate::{address::TokenAddress, token::TokenRecord};

/// Bounded in-memory index of recently resolved token records.
///
/// Entries only ever come from the store or from a live resolution that was
/// just persisted; the cache never originates data and is not consulted for
/// anything beyond its own entries. Freshness of a cached record is judged by
/// its `last_updated`, not by how long the entry has been cached.
#[derive(Clone)]
pub struct TokenCache {
    inner: Cache<TokenAddress, TokenRecord>,
}

impl TokenCache {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .name("token_records")
            .max_capacity(max_capacity)
            .build();

        Self { inner }
    }

    pub async fn get(&self, address: &TokenAddress) -> Option<TokenRecord> {
        self.inner.get(address).await
    }

    pub async fn put(&self, record: TokenRecord) {
        trace!(address = %record.address, "caching token record");
        self.inner.insert(record.address, record).await;
    }

    /// Approximate number of cached records. Pending evictions may not be
    /// reflected until [`TokenCache::run_pending_tasks`] is awaited.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::token::TokenMetadata;

    fn record(n: u8) -> TokenRecord {
        let address = TokenAddress::parse(&format!("0x{:040x}", n)).unwrap();
        TokenRecord::new(
            address,
            TokenMetadata {
                name: format!("Token {n}"),
                symbol: format!("T{n}"),
                decimals: 18,
            },
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = TokenCache::new(16);
        let token = record(1);

        assert_eq!(cache.get(&token.address).await, None);
        cache.put(token.clone()).await;
        assert_eq!(cache.get(&token.address).await, Some(token));
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_entry() {
        let cache = TokenCache::new(16);
        let mut token = record(1);
        cache.put(token.clone()).await;

        token.symbol = "NEW".to_string();
        cache.put(token.clone()).await;

        assert_eq!(cache.get(&token.address).await.unwrap().symbol, "NEW");
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cache = TokenCache::new(8);
        for n in 0..64 {
            cache.put(record(n)).await;
        }
        cache.run_pending_tasks().await;

        assert!(cache.entry_count() <= 8, "cache grew to {}", cache.entry_count());
    }
}
