use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr as _, eyre};
use sqlx::{PgPool, postgres::PgPoolOptions};
use thiserror::Error;
use tracing::info;

use crate::{address::TokenAddress, config::DatabaseConfig, token::TokenRecord};

pub use tokens::TokenRepository;

mod tokens;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error("malformed token row for {address}: {reason}")]
    Decode { address: String, reason: String },
}

/// Persistent store of token records keyed by canonical address.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, address: &TokenAddress) -> Result<Option<TokenRecord>, StoreError>;

    async fn upsert(&self, record: &TokenRecord) -> Result<(), StoreError>;

    /// Up to `limit` records ordered by `last_updated`, oldest first.
    async fn oldest(&self, limit: usize) -> Result<Vec<TokenRecord>, StoreError>;

    /// Upserts every record in a single transaction; on error none are applied.
    async fn upsert_batch(&self, records: &[TokenRecord]) -> Result<(), StoreError>;
}

pub struct Handle {
    pool: Arc<PgPool>,
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Handle {
    pub fn from_config(config: &DatabaseConfig) -> eyre::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(config.idle_timeout())
            .connect_lazy(&config.url)
            .map_err(|e| eyre!("Failed to connect to database: {}", e))?;

        info!(
            "Connected to database with {} max connections",
            config.max_connections
        );

        Ok(Handle {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    pub async fn migrate(&self) -> eyre::Result<()> {
        MIGRATOR
            .run(self.pool.as_ref())
            .await
            .wrap_err("failed to apply database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .is_ok()
    }

    pub fn token_repository(&self) -> TokenRepository {
        TokenRepository::new(Arc::clone(&self.pool))
    }
}
