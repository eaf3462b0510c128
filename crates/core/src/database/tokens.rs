use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row as _, postgres::PgRow};
use tracing::{debug, instrument};

use super::{StoreError, TokenStore};
use crate::{address::TokenAddress, token::TokenRecord};

const UPSERT_TOKEN: &str = r#"
    INSERT INTO tokens (
        address, name, symbol, decimals, price, last_updated, image_url
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (address) DO UPDATE SET
        name = EXCLUDED.name,
        symbol = EXCLUDED.symbol,
        decimals = EXCLUDED.decimals,
        price = EXCLUDED.price,
        last_updated = EXCLUDED.last_updated,
        image_url = COALESCE(EXCLUDED.image_url, tokens.image_url)
"#;

#[derive(Clone)]
pub struct TokenRepository {
    pool: Arc<PgPool>,
}

impl TokenRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for TokenRepository {
    #[instrument(skip_all, fields(%address))]
    async fn get(&self, address: &TokenAddress) -> Result<Option<TokenRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT address, name, symbol, decimals, price, last_updated, image_url
            FROM tokens
            WHERE address = $1
            "#,
        )
        .bind(address.to_string())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(try_token_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(address = %record.address))]
    async fn upsert(&self, record: &TokenRecord) -> Result<(), StoreError> {
        bind_token(sqlx::query(UPSERT_TOKEN), record)
            .execute(&*self.pool)
            .await?;

        debug!("upserted token record");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn oldest(&self, limit: usize) -> Result<Vec<TokenRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, name, symbol, decimals, price, last_updated, image_url
            FROM tokens
            ORDER BY last_updated ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(try_token_from_row).collect()
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_batch(&self, records: &[TokenRecord]) -> Result<(), StoreError> {
        // dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_token(sqlx::query(UPSERT_TOKEN), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("committed token batch");
        Ok(())
    }
}

fn bind_token<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    record: &'q TokenRecord,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(record.address.to_string())
        .bind(&record.name)
        .bind(&record.symbol)
        .bind(i32::from(record.decimals))
        .bind(&record.price)
        .bind(record.last_updated)
        .bind(&record.image)
}

fn try_token_from_row(row: PgRow) -> Result<TokenRecord, StoreError> {
    let raw_address: String = row.try_get("address")?;
    let address = TokenAddress::parse(&raw_address).map_err(|err| StoreError::Decode {
        address: raw_address.clone(),
        reason: err.to_string(),
    })?;

    let decimals: i32 = row.try_get("decimals")?;
    let decimals = u8::try_from(decimals).map_err(|_| StoreError::Decode {
        address: raw_address.clone(),
        reason: format!("decimals out of range: {decimals}"),
    })?;

    let price: Option<BigDecimal> = row.try_get("price")?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;

    Ok(TokenRecord {
        address,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        decimals,
        price,
        last_updated,
        image: row.try_get("image_url")?,
    })
}
