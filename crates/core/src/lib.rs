pub mod address;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod refresh;
pub mod resolver;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use address::TokenAddress;
pub use error::Error;
pub use token::{TokenMetadata, TokenRecord};
