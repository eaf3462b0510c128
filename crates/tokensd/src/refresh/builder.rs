use std::{sync::Arc, time::Duration};

use color_eyre::eyre::{self, ensure};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tokens_core::refresh::BulkRefresher;

use super::{Handle, Worker};

pub struct Builder {
    pub refresher: Arc<BulkRefresher>,
    pub interval: Duration,
    pub shutdown_token: CancellationToken,
    /// Fired once the store schema is in place; no run starts before it
    pub store_ready: oneshot::Receiver<()>,
}

impl Builder {
    pub fn build(self) -> eyre::Result<Handle> {
        let Self {
            refresher,
            interval,
            shutdown_token,
            store_ready,
        } = self;

        ensure!(!interval.is_zero(), "refresh interval must be non-zero");

        let worker = Worker {
            refresher,
            interval,
            shutdown_token: shutdown_token.clone(),
            store_ready,
        };

        let worker_handle = tokio::task::spawn(async move { worker.run().await });

        Ok(Handle {
            shutdown_token,
            worker_handle: Some(worker_handle),
        })
    }
}
