use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr as _};
use tokens_core::{
    cache::TokenCache,
    config::Config,
    coordinator::Coordinator,
    database,
    refresh::{BulkRefresher, RefreshOutcome},
    resolver::{CoinGecko, Erc20Metadata, RetryPolicy},
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tokens", about)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Resolve a token and print its record as JSON
    Resolve {
        /// Token contract address, with or without the 0x prefix
        address: String,
    },

    /// Refresh the prices of the least recently updated tokens once
    Refresh,

    /// Apply pending database migrations
    Migrate,
}

impl Cli {
    pub(crate) async fn run(self, config: Config) -> eyre::Result<()> {
        let db = database::Handle::from_config(&config.database)
            .wrap_err("failed to set up database pool")?;

        match self.command {
            Commands::Migrate => db.migrate().await,
            Commands::Resolve { address } => {
                let coordinator = coordinator(&config, &db)?;
                let record = coordinator
                    .resolve(&address)
                    .await
                    .wrap_err_with(|| format!("failed to resolve {address}"))?;

                let json = serde_json::to_string_pretty(&record)
                    .wrap_err("failed to serialize token record")?;
                println!("{json}");
                Ok(())
            }
            Commands::Refresh => {
                let refresher = refresher(&config, &db)?;
                match refresher.run_once().await? {
                    RefreshOutcome::Completed(summary) => println!(
                        "Refreshed {} of {} tokens",
                        summary.updated, summary.selected
                    ),
                    RefreshOutcome::Skipped => println!("Refresh skipped"),
                }
                Ok(())
            }
        }
    }
}

fn coordinator(config: &Config, db: &database::Handle) -> eyre::Result<Coordinator> {
    let coingecko =
        Arc::new(CoinGecko::new(config.coingecko.clone()).wrap_err("failed to set up coingecko client")?);
    let erc20 = Arc::new(
        Erc20Metadata::new(&config.chain.rpc_url).wrap_err("failed to set up chain provider")?,
    );

    info!(rpc_url = %config.chain.rpc_url, "🔗 Initialized chain provider");

    Ok(Coordinator::new(
        TokenCache::new(config.cache.max_capacity),
        Arc::new(db.token_repository()),
        coingecko.clone(),
        erc20,
        config.refresh.price_ttl(),
    )
    .with_images(coingecko)
    .with_retry(RetryPolicy::from_config(&config.upstream)))
}

fn refresher(config: &Config, db: &database::Handle) -> eyre::Result<BulkRefresher> {
    let coingecko =
        Arc::new(CoinGecko::new(config.coingecko.clone()).wrap_err("failed to set up coingecko client")?);

    Ok(BulkRefresher::new(
        TokenCache::new(config.cache.max_capacity),
        Arc::new(db.token_repository()),
        coingecko,
        config.refresh.batch_size,
    )
    .with_retry(RetryPolicy::from_config(&config.upstream)))
}
