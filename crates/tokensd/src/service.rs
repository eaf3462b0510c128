use std::{sync::Arc, time::Duration};

use axum::Router;
use color_eyre::eyre::{self, WrapErr as _, eyre};
use tokio::{net::TcpListener, select, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{api, refresh};
use tokens_core::{
    cache::TokenCache,
    config::Config,
    coordinator::Coordinator,
    database,
    refresh::BulkRefresher,
    resolver::{CoinGecko, Erc20Metadata, RetryPolicy},
};

pub(super) struct Service {
    shutdown_token: CancellationToken,
    cfg: Config,
    db: database::Handle,
    state: api::AppState,
    refresh_handle: refresh::Handle,
    store_ready: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<eyre::Result<()>>>,
}

impl Service {
    pub(super) fn new(cfg: Config, shutdown_token: CancellationToken) -> eyre::Result<Self> {
        let db = database::Handle::from_config(&cfg.database)
            .wrap_err("failed to set up database pool")?;
        let store = Arc::new(db.token_repository());

        let coingecko = Arc::new(
            CoinGecko::new(cfg.coingecko.clone()).wrap_err("failed to set up coingecko client")?,
        );
        let erc20 = Arc::new(
            Erc20Metadata::new(&cfg.chain.rpc_url).wrap_err("failed to set up chain provider")?,
        );
        let retry = RetryPolicy::from_config(&cfg.upstream);

        // shared between the request path and the refresh job
        let cache = TokenCache::new(cfg.cache.max_capacity);

        let coordinator = Coordinator::new(
            cache.clone(),
            store.clone(),
            coingecko.clone(),
            erc20.clone(),
            cfg.refresh.price_ttl(),
        )
        .with_images(coingecko.clone())
        .with_retry(retry);

        let refresher = BulkRefresher::new(cache, store, coingecko, cfg.refresh.batch_size)
            .with_retry(retry);

        info!(
            price_ttl = %humantime::format_duration(Duration::from_secs(cfg.refresh.price_ttl_secs)),
            batch_size = cfg.refresh.batch_size,
            cache_capacity = cfg.cache.max_capacity,
            "🪙 Initialized token service"
        );

        // the worker idles until `run` has applied the migrations
        let (store_ready, store_ready_rx) = oneshot::channel();
        let refresh_handle = refresh::Builder {
            refresher: Arc::new(refresher),
            interval: cfg.refresh.interval(),
            shutdown_token: shutdown_token.child_token(),
            store_ready: store_ready_rx,
        }
        .build()
        .wrap_err("failed to start refresh worker")?;

        let state = api::AppState {
            coordinator: Arc::new(coordinator),
            db: db.clone(),
            chain: erc20.as_ref().clone(),
        };

        Ok(Self {
            shutdown_token,
            cfg,
            db,
            state,
            refresh_handle,
            store_ready: Some(store_ready),
            server: None,
        })
    }

    pub(super) async fn run(mut self) -> eyre::Result<()> {
        let reason = self.run_until_stopped().await;
        Ok(self.shutdown(reason).await)
    }

    async fn run_until_stopped(&mut self) -> eyre::Result<&'static str> {
        self.db.migrate().await?;
        if let Some(store_ready) = self.store_ready.take() {
            // only fails if the worker is already gone, which the loop below reports
            let _ = store_ready.send(());
        }

        let server = self.spawn_server().await?;
        self.server = Some(server);

        loop {
            select! {
                biased;

                () = self.shutdown_token.cancelled() => break Ok("received shutdown signal"),

                res = join_server(&mut self.server) => {
                    break match res {
                        Ok(()) => Err(eyre!("http server exited")),
                        Err(e) => Err(e),
                    };
                }

                res = &mut self.refresh_handle => {
                    break match res {
                        Ok(()) => Err(eyre!("refresh worker exited")),
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    async fn spawn_server(&self) -> eyre::Result<JoinHandle<eyre::Result<()>>> {
        let bind_addr = format!("{}:{}", self.cfg.server.host, self.cfg.server.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .wrap_err_with(|| format!("failed to bind {bind_addr}"))?;
        info!("🚀 Tokens API server running at http://{bind_addr}");

        Ok(serve(
            listener,
            api::router(self.state.clone()),
            self.shutdown_token.child_token(),
        ))
    }

    #[instrument(skip_all)]
    async fn shutdown(mut self, reason: eyre::Result<&'static str>) {
        const WAIT_BEFORE_ABORT: Duration = Duration::from_secs(25);

        // trigger the shutdown token in case it wasn't triggered yet
        self.shutdown_token.cancel();

        let message = format!(
            "waiting {} for all subtasks to shutdown before aborting",
            humantime::format_duration(WAIT_BEFORE_ABORT)
        );
        match &reason {
            Ok(reason) => info!(%reason, message),
            Err(reason) => error!(%reason, message),
        };

        let (server, refresh) = tokio::join!(
            tokio::time::timeout(WAIT_BEFORE_ABORT, join_server(&mut self.server)),
            tokio::time::timeout(WAIT_BEFORE_ABORT, self.refresh_handle.shutdown()),
        );

        match server {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to shutdown http server: {}", e),
            Err(_) => warn!("http server did not drain in time"),
        }
        match refresh {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to shutdown refresh worker: {}", e),
            Err(_) => warn!("refresh worker did not shut down in time"),
        }
    }
}

/// Serves `app` until `shutdown` fires, then stops accepting and lets
/// in-flight requests finish.
fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> JoinHandle<eyre::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .wrap_err("axum server error")
    })
}

/// Waits for the server task if one is running, and forgets it once it has
/// finished.
async fn join_server(server: &mut Option<JoinHandle<eyre::Result<()>>>) -> eyre::Result<()> {
    let Some(task) = server.as_mut() else {
        return Ok(());
    };
    let res = task.await;
    *server = None;
    match res {
        Ok(res) => res.wrap_err("http server failed"),
        Err(e) => Err(e).wrap_err("http server panicked"),
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_request() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "done"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let mut server = Some(serve(listener, app, shutdown.clone()));

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();

        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("done"), "{response}");

        tokio::time::timeout(Duration::from_secs(5), join_server(&mut server))
            .await
            .unwrap()
            .unwrap();
        assert!(server.is_none());
    }

    #[tokio::test]
    async fn test_join_server_without_server_returns_at_once() {
        let mut server = None;
        join_server(&mut server).await.unwrap();
    }
}
