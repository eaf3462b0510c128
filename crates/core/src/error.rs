use thiserror::Error;

use crate::{
    address::{InvalidAddress, TokenAddress},
    database::StoreError,
    resolver::ResolveError,
};

/// Errors surfaced by the coordinator and the bulk refresher.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller supplied a malformed address. Raised before any I/O.
    #[error(transparent)]
    Validation(#[from] InvalidAddress),

    /// An upstream resolver failed or timed out for a single token.
    #[error("failed to resolve token {address}: {source}")]
    Resolution {
        address: TokenAddress,
        #[source]
        source: ResolveError,
    },

    /// The combined price lookup of a bulk refresh run failed.
    #[error("failed to resolve prices for a batch of {count} tokens: {source}")]
    BatchResolution {
        count: usize,
        #[source]
        source: ResolveError,
    },

    #[error("token store failure: {0}")]
    Persistence(#[from] StoreError),
}

impl Error {
    pub(crate) fn resolution(address: TokenAddress, source: ResolveError) -> Self {
        Self::Resolution { address, source }
    }
}
