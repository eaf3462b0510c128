use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::address::TokenAddress;

/// On-chain metadata of a token. Resolved once and never refetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMetadata {
    /// Metadata of the chain's native asset, which has no contract to ask.
    pub fn native_ether() -> Self {
        Self {
            name: "Ether".to_string(),
            symbol: "ETH".to_string(),
            decimals: 18,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub address: TokenAddress,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// `None` when no price is known for the token, which is not the same as a zero price.
    pub price: Option<BigDecimal>,
    /// Time of the last successful price observation.
    pub last_updated: DateTime<Utc>,
    pub image: Option<String>,
}

impl TokenRecord {
    pub fn new(
        address: TokenAddress,
        metadata: TokenMetadata,
        price: Option<BigDecimal>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let TokenMetadata {
            name,
            symbol,
            decimals,
        } = metadata;

        Self {
            address,
            name,
            symbol,
            decimals,
            price,
            last_updated,
            image: None,
        }
    }

    /// A price observation is stale once strictly more than `ttl` has passed.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now > self.last_updated + ttl
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        !self.is_stale(now, ttl)
    }

    /// Records a new price observation, leaving metadata untouched.
    pub fn observe_price(&mut self, price: Option<BigDecimal>, at: DateTime<Utc>) {
        self.price = price;
        self.last_updated = at;
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    fn record(last_updated: DateTime<Utc>) -> TokenRecord {
        TokenRecord::new(
            TokenAddress::parse("0x1234567890123456789012345678901234567890").unwrap(),
            TokenMetadata {
                name: "Dummy".to_string(),
                symbol: "DMY".to_string(),
                decimals: 18,
            },
            Some(BigDecimal::from_str("1.5").unwrap()),
            last_updated,
        )
    }

    #[test]
    fn test_freshness_boundary_is_fresh() {
        let ttl = TimeDelta::hours(1);
        let now = Utc::now();

        assert!(record(now - ttl).is_fresh(now, ttl));
        assert!(record(now - ttl + TimeDelta::milliseconds(1)).is_fresh(now, ttl));
        assert!(record(now - ttl - TimeDelta::milliseconds(1)).is_stale(now, ttl));
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let ttl = TimeDelta::seconds(0);
        let now = Utc::now();
        assert!(record(now + TimeDelta::seconds(5)).is_fresh(now, ttl));
    }

    #[test]
    fn test_observe_price_keeps_metadata() {
        let then = Utc::now() - TimeDelta::days(2);
        let mut token = record(then);
        let now = Utc::now();

        token.observe_price(None, now);

        assert_eq!(token.price, None);
        assert_eq!(token.last_updated, now);
        assert_eq!(token.name, "Dummy");
        assert_eq!(token.symbol, "DMY");
        assert_eq!(token.decimals, 18);
    }

    #[test]
    fn test_serializes_missing_price_as_null() {
        let mut token = record(Utc::now());
        token.price = None;

        let json = serde_json::to_value(&token).unwrap();
        assert!(json["price"].is_null());
        assert_eq!(json["address"], "0x1234567890123456789012345678901234567890");
        assert!(json.get("lastUpdated").is_some());
    }
}
