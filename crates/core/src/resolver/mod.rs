//! Upstream collaborators that resolve token data the store does not know yet.
//!
//! Implementations only translate between the wire and the domain types; the
//! timeout and retry budget of every call is applied by the caller through
//! [`RetryPolicy`], so it holds no matter which implementation is plugged in.
use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::{address::TokenAddress, config::UpstreamConfig, token::TokenMetadata};

pub use coingecko::CoinGecko;
pub use erc20::Erc20Metadata;

mod coingecko;
mod erc20;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream responded with status {0}")]
    Status(StatusCode),

    #[error("rpc transport error: {0}")]
    Rpc(String),

    #[error("contract call failed: {0}")]
    Contract(String),

    #[error("no price available")]
    PriceUnavailable,

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl ResolveError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Rpc(_) => true,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Contract(_) | Self::PriceUnavailable | Self::Malformed(_) => false,
        }
    }
}

/// Resolves prices for one or many tokens. Addresses without a known price
/// are omitted from the returned map.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceResolver: Send + Sync {
    async fn get_prices(
        &self,
        addresses: &[TokenAddress],
    ) -> Result<HashMap<TokenAddress, BigDecimal>, ResolveError>;
}

/// Resolves name, symbol and decimals from the chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn get_metadata(&self, address: &TokenAddress) -> Result<TokenMetadata, ResolveError>;
}

/// Resolves a display image for a token, if the upstream has one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn get_image(&self, address: &TokenAddress) -> Result<Option<String>, ResolveError>;
}

/// Bounds an upstream call by a timeout and retries it once on transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            timeout: config.timeout(),
            backoff: config.retry_backoff(),
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        match self.attempt(&mut call).await {
            Err(err) if err.is_transient() => {
                warn!(operation, error = %err, "transient upstream failure, retrying once");
                tokio::time::sleep(self.backoff).await;
                self.attempt(&mut call).await
            }
            res => res,
        }
    }

    async fn attempt<T, F, Fut>(&self, call: &mut F) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        tokio::time::timeout(self.timeout, call())
            .await
            .unwrap_or_else(|_| Err(ResolveError::Timeout(self.timeout)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}
