use std::{collections::HashMap, str::FromStr as _};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use color_eyre::eyre::{self, WrapErr as _};
use reqwest::{
    Response, StatusCode,
    header::{HeaderMap, HeaderValue},
};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{ImageResolver, PriceResolver, ResolveError};
use crate::{address::TokenAddress, config::CoinGeckoConfig};

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// `{ "<id or contract>": { "<vs currency>": price } }`
type CoinGeckoPrice = HashMap<String, HashMap<String, f64>>;

#[derive(Debug, Deserialize)]
struct CoinGeckoContract {
    image: Option<CoinGeckoImage>,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoImage {
    thumb: Option<String>,
    small: Option<String>,
    large: Option<String>,
}

/// CoinGecko client for token prices and images.
///
/// The native ether placeholder address is priced through `/simple/price`
/// with the configured native coin id; every other address goes through a
/// single `/simple/token_price/{platform}` call.
#[derive(Debug, Clone)]
pub struct CoinGecko {
    client: reqwest::Client,
    config: CoinGeckoConfig,
}

impl CoinGecko {
    pub fn new(config: CoinGeckoConfig) -> eyre::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(api_key).wrap_err("invalid coingecko api key")?;
            headers.insert(API_KEY_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .wrap_err("failed to build coingecko http client")?;

        Ok(Self { client, config })
    }

    fn token_price_url(&self) -> String {
        format!(
            "{}/simple/token_price/{}",
            self.config.base_url, self.config.platform
        )
    }

    fn coin_price_url(&self) -> String {
        format!("{}/simple/price", self.config.base_url)
    }

    fn contract_url(&self, address: &TokenAddress) -> String {
        format!(
            "{}/coins/{}/contract/{}",
            self.config.base_url, self.config.platform, address
        )
    }

    #[instrument(skip_all, fields(count = addresses.len()))]
    async fn token_prices(
        &self,
        addresses: &[TokenAddress],
    ) -> Result<HashMap<TokenAddress, BigDecimal>, ResolveError> {
        let contract_addresses = addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .client
            .get(self.token_price_url())
            .query(&[
                ("contract_addresses", contract_addresses.as_str()),
                ("vs_currencies", self.config.vs_currency.as_str()),
            ])
            .send()
            .await?;
        let body: CoinGeckoPrice = ensure_success(response)?.json().await?;

        debug!(received = body.len(), "received token prices from coingecko");
        Ok(prices_by_address(body, &self.config.vs_currency))
    }

    #[instrument(skip_all)]
    async fn native_price(&self) -> Result<Option<BigDecimal>, ResolveError> {
        let response = self
            .client
            .get(self.coin_price_url())
            .query(&[
                ("ids", self.config.native_coin_id.as_str()),
                ("vs_currencies", self.config.vs_currency.as_str()),
            ])
            .send()
            .await?;
        let body: CoinGeckoPrice = ensure_success(response)?.json().await?;

        body.get(&self.config.native_coin_id)
            .and_then(|quotes| quotes.get(&self.config.vs_currency))
            .map(|price| decimal_from_f64(*price))
            .transpose()
    }
}

#[async_trait]
impl PriceResolver for CoinGecko {
    async fn get_prices(
        &self,
        addresses: &[TokenAddress],
    ) -> Result<HashMap<TokenAddress, BigDecimal>, ResolveError> {
        let (native, tokens): (Vec<TokenAddress>, Vec<TokenAddress>) = addresses
            .iter()
            .copied()
            .partition(TokenAddress::is_native_ether);

        let mut prices = if tokens.is_empty() {
            HashMap::new()
        } else {
            self.token_prices(&tokens).await?
        };

        if let Some(address) = native.first() {
            if let Some(price) = self.native_price().await? {
                prices.insert(*address, price);
            }
        }

        Ok(prices)
    }
}

#[async_trait]
impl ImageResolver for CoinGecko {
    #[instrument(skip_all, fields(%address))]
    async fn get_image(&self, address: &TokenAddress) -> Result<Option<String>, ResolveError> {
        if address.is_native_ether() {
            return Ok(None);
        }

        let response = self.client.get(self.contract_url(address)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: CoinGeckoContract = ensure_success(response)?.json().await?;

        Ok(body
            .image
            .and_then(|image| image.small.or(image.large).or(image.thumb)))
    }
}

fn ensure_success(response: Response) -> Result<Response, ResolveError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ResolveError::Status(status))
    }
}

/// CoinGecko keys its answer by lowercase contract address; entries are
/// re-parsed so callers match on the canonical form.
fn prices_by_address(body: CoinGeckoPrice, vs_currency: &str) -> HashMap<TokenAddress, BigDecimal> {
    body.into_iter()
        .filter_map(|(key, quotes)| {
            let address = match TokenAddress::parse(&key) {
                Ok(address) => address,
                Err(err) => {
                    warn!(%key, %err, "ignoring price for unparseable address");
                    return None;
                }
            };

            let Some(price) = quotes.get(vs_currency) else {
                warn!(%address, vs_currency, "received no price for token");
                return None;
            };

            match decimal_from_f64(*price) {
                Ok(price) => Some((address, price)),
                Err(err) => {
                    warn!(%address, %err, "ignoring malformed price");
                    None
                }
            }
        })
        .collect()
}

fn decimal_from_f64(value: f64) -> Result<BigDecimal, ResolveError> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|err| ResolveError::Malformed(format!("price {value}: {err}")))
}
