//! Background worker driving the bulk price refresh on a fixed interval.

use std::{pin::Pin, sync::Arc, time::Duration};

use color_eyre::eyre::{self, WrapErr as _};
use futures::Future;
use tokio::{select, sync::oneshot, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use tokens_core::refresh::{BulkRefresher, RefreshOutcome};

pub use builder::Builder;
mod builder;

pub struct Handle {
    shutdown_token: CancellationToken,
    worker_handle: Option<tokio::task::JoinHandle<eyre::Result<()>>>,
}

impl Handle {
    /// Cancels the worker and waits for it. A worker that already finished
    /// is not awaited again.
    pub async fn shutdown(&mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        let Some(task) = self.worker_handle.take() else {
            return Ok(());
        };
        match task.await {
            Ok(res) => res,
            Err(e) => {
                error!("Refresh worker failed: {}", e);
                Err(e.into())
            }
        }
    }
}

// Awaiting the handle deals with the Worker's result
impl Future for Handle {
    type Output = eyre::Result<()>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use futures::future::FutureExt as _;

        let task = self
            .worker_handle
            .as_mut()
            .expect("refresh handle must not be polled after completion");

        let res = std::task::ready!(task.poll_unpin(cx));
        self.worker_handle = None;
        std::task::Poll::Ready(match res {
            Ok(worker_res) => match worker_res {
                Ok(()) => Ok(()),
                Err(e) => Err(e).wrap_err("refresh task returned with err"),
            },
            Err(e) => Err(e).wrap_err("refresh task panicked"),
        })
    }
}

struct Worker {
    refresher: Arc<BulkRefresher>,
    interval: Duration,
    shutdown_token: CancellationToken,
    store_ready: oneshot::Receiver<()>,
}

impl Worker {
    #[instrument(name = "refresh_worker", skip(self))]
    async fn run(self) -> eyre::Result<()> {
        select! {
            biased;

            () = self.shutdown_token.cancelled() => {
                info!("Refresh worker received shutdown signal before the store was ready");
                return Ok(());
            }

            res = self.store_ready => {
                if res.is_err() {
                    info!("Store never became ready, refresh worker exiting");
                    return Ok(());
                }
            }
        }

        info!(
            interval = %humantime::format_duration(self.interval),
            "Starting refresh worker"
        );

        // the first tick completes immediately, so a run happens at start-up
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("Refresh worker received shutdown signal");
                    break Ok(());
                }

                _ = ticker.tick() => {
                    // a failed run is retried on the next tick
                    match self.refresher.run_once().await {
                        Ok(RefreshOutcome::Completed(summary)) => {
                            info!(selected = summary.selected, updated = summary.updated, "refresh run finished");
                        }
                        Ok(RefreshOutcome::Skipped) => {}
                        Err(e) => error!(error = %e, "refresh run failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use bigdecimal::BigDecimal;
    use chrono::{TimeDelta, Utc};
    use tokens_core::{
        TokenAddress, TokenMetadata, TokenRecord,
        cache::TokenCache,
        testing::{InMemoryStore, StaticResolver},
    };

    use super::*;

    fn dai() -> TokenAddress {
        TokenAddress::parse("0x6b175474e89094c44da98b954eedeac495271d0f").unwrap()
    }

    fn fixture() -> (Arc<InMemoryStore>, Arc<StaticResolver>, Arc<BulkRefresher>) {
        let metadata = TokenMetadata {
            name: "Dai Stablecoin".to_string(),
            symbol: "DAI".to_string(),
            decimals: 18,
        };
        let store = Arc::new(InMemoryStore::with_records([TokenRecord::new(
            dai(),
            metadata.clone(),
            None,
            Utc::now() - TimeDelta::days(1),
        )]));
        let prices = Arc::new(StaticResolver::new().with_token(
            dai(),
            metadata,
            Some(BigDecimal::from_str("0.9998").unwrap()),
        ));
        let refresher = Arc::new(BulkRefresher::new(
            TokenCache::new(16),
            Arc::clone(&store) as _,
            Arc::clone(&prices) as _,
            50,
        ));
        (store, prices, refresher)
    }

    fn ready() -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_at_startup_and_every_interval() {
        let (store, prices, refresher) = fixture();
        let mut handle = Builder {
            refresher,
            interval: Duration::from_secs(3600),
            shutdown_token: CancellationToken::new(),
            store_ready: ready(),
        }
        .build()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(prices.price_calls(), 1);
        assert_eq!(
            store.record(&dai()).unwrap().price,
            Some(BigDecimal::from_str("0.9998").unwrap())
        );

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(prices.price_calls(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_keeps_worker_alive() {
        let (_store, prices, refresher) = fixture();
        prices.set_unavailable(true);
        let mut handle = Builder {
            refresher,
            interval: Duration::from_secs(60),
            shutdown_token: CancellationToken::new(),
            store_ready: ready(),
        }
        .build()
        .unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;

        // each run retries once on the 503
        assert_eq!(prices.price_calls(), 4);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let (_, _, refresher) = fixture();
        let res = Builder {
            refresher,
            interval: Duration::ZERO,
            shutdown_token: CancellationToken::new(),
            store_ready: ready(),
        }
        .build();

        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_waits_for_store() {
        let (_store, prices, refresher) = fixture();
        let (store_ready, rx) = oneshot::channel();
        let mut handle = Builder {
            refresher,
            interval: Duration::from_secs(60),
            shutdown_token: CancellationToken::new(),
            store_ready: rx,
        }
        .build()
        .unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(prices.price_calls(), 0);

        store_ready.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(prices.price_calls(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exits_when_store_never_ready() {
        let (_store, prices, refresher) = fixture();
        let (store_ready, rx) = oneshot::channel::<()>();
        let handle = Builder {
            refresher,
            interval: Duration::from_secs(60),
            shutdown_token: CancellationToken::new(),
            store_ready: rx,
        }
        .build()
        .unwrap();

        drop(store_ready);

        handle.await.unwrap();
        assert_eq!(prices.price_calls(), 0);
    }
}
