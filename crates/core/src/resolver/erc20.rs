use std::time::Duration;

use alloy::{
    providers::{DynProvider, Provider as _, ProviderBuilder},
    sol,
    transports::RpcError,
};
use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr as _};
use tracing::{debug, instrument, warn};

use super::{MetadataResolver, ResolveError};
use crate::{address::TokenAddress, token::TokenMetadata};

// Taken from https://github.com/OpenZeppelin/openzeppelin-contracts/blob/3790c59623e99cb0272ddf84e6a17a5979d06b35/contracts/token/ERC20/extensions/IERC20Metadata.sol
sol!(
    #[sol(rpc)]
    contract IERC20Metadata {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
);

/// Reads token metadata from the ERC-20 contract over JSON-RPC.
#[derive(Clone)]
pub struct Erc20Metadata {
    provider: DynProvider,
}

impl Erc20Metadata {
    pub fn new(rpc_url: &str) -> eyre::Result<Self> {
        let provider = ProviderBuilder::new()
            .connect_http(rpc_url.parse().wrap_err("Failed to parse RPC URL")?)
            .erased();

        Ok(Self { provider })
    }

    /// Whether the node answers a block number query within `timeout`.
    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, async { self.provider.get_block_number().await }).await
        {
            Ok(Ok(block)) => {
                debug!(block, "chain node is reachable");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "chain node health check failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?timeout, "chain node health check timed out");
                false
            }
        }
    }
}

impl std::fmt::Debug for Erc20Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Erc20Metadata").finish_non_exhaustive()
    }
}

#[async_trait]
impl MetadataResolver for Erc20Metadata {
    #[instrument(skip_all, fields(%address))]
    async fn get_metadata(&self, address: &TokenAddress) -> Result<TokenMetadata, ResolveError> {
        if address.is_native_ether() {
            return Ok(TokenMetadata::native_ether());
        }

        let token = IERC20Metadata::new(address.as_address(), self.provider.clone());
        let (name, symbol, decimals) = tokio::try_join!(
            async { token.name().call().await },
            async { token.symbol().call().await },
            async { token.decimals().call().await },
        )
        .map_err(contract_error)?;

        debug!(%name, %symbol, decimals, "read erc20 metadata");
        Ok(TokenMetadata {
            name,
            symbol,
            decimals,
        })
    }
}

/// Reverts and undecodable return data are permanent for that contract;
/// anything the transport itself failed on may succeed on a second try.
fn contract_error(err: alloy::contract::Error) -> ResolveError {
    match err {
        alloy::contract::Error::TransportError(RpcError::ErrorResp(payload)) => {
            ResolveError::Contract(payload.to_string())
        }
        alloy::contract::Error::TransportError(err) => ResolveError::Rpc(err.to_string()),
        err => ResolveError::Contract(err.to_string()),
    }
}
