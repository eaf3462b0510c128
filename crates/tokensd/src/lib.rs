//! The token daemon.
//!
//! [`TokenService::spawn`] starts one supervising task. It applies the store
//! migrations, then releases the refresh worker and starts the HTTP server,
//! and stops everything as soon as either subtask exits or shutdown is
//! requested. On shutdown the server stops accepting connections and drains
//! in-flight requests while the worker finishes its current run.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use color_eyre::eyre::{self, Context as _};
use tokens_core::config::Config;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod api;
mod refresh;
mod service;
pub mod telemetry;

/// Handle to a running token daemon. Resolves when the daemon stops on its
/// own, which only happens on failure.
pub struct TokenService {
    shutdown_token: CancellationToken,
    task: Option<JoinHandle<eyre::Result<()>>>,
}

impl TokenService {
    /// Builds the store pool, resolvers, cache, coordinator and refresh
    /// worker, and spawns the task supervising them.
    ///
    /// # Errors
    /// Returns an error if a client cannot be built from `cfg`, e.g. on a
    /// malformed database or RPC URL.
    pub fn spawn(cfg: Config) -> eyre::Result<Self> {
        let shutdown_token = CancellationToken::new();
        let inner = service::Service::new(cfg, shutdown_token.child_token())?;
        let task = tokio::spawn(inner.run());

        Ok(Self {
            shutdown_token,
            task: Some(task),
        })
    }

    /// Requests shutdown and waits until the HTTP server has drained and the
    /// refresh worker has stopped.
    ///
    /// # Errors
    /// Returns an error if the supervising task failed or panicked.
    pub async fn shutdown(mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        match self.task.take() {
            Some(task) => flatten_join_result(task.await),
            None => Ok(()),
        }
    }
}

impl Future for TokenService {
    type Output = eyre::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        use futures::future::FutureExt as _;

        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = std::task::ready!(task.poll_unpin(cx));
        self.task = None;
        Poll::Ready(flatten_join_result(res))
    }
}

fn flatten_join_result<T>(res: Result<eyre::Result<T>, JoinError>) -> eyre::Result<T> {
    match res {
        Ok(Ok(res)) => Ok(res),
        Ok(Err(e)) => Err(e).wrap_err("token service returned with error"),
        Err(e) => Err(e).wrap_err("token service panicked"),
    }
}
