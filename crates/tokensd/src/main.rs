use std::process::ExitCode;

use color_eyre::eyre::{self, eyre};
use tokens_core::config::Config;
use tokensd::{TokenService, telemetry};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error report handler:\n{err:?}");
        return ExitCode::FAILURE;
    }

    // set up config
    let cfg: Config = match Config::load() {
        Err(err) => {
            eprintln!("failed to read config:\n{err:?}");
            return ExitCode::FAILURE;
        }
        Ok(cfg) => cfg,
    };

    // set up tracing
    if let Err(err) = telemetry::init() {
        eprintln!("failed to set up logging:\n{err:?}");
        return ExitCode::FAILURE;
    }

    // spawn service
    let mut service = match TokenService::spawn(cfg) {
        Ok(service) => service,
        Err(e) => {
            error!(%e, "failed initializing token service");
            return ExitCode::FAILURE;
        }
    };

    let mut sigterm = signal(SignalKind::terminate())
        .expect("setting sigterm listener on unix should always work");
    let mut sigint = signal(SignalKind::interrupt())
        .expect("setting sigint listener on unix should always work");

    let exit_reason = select! {
        _ = sigterm.recv() => Ok("received SIGTERM"),
        _ = sigint.recv() => Ok("received SIGINT"),
        res = &mut service => {
            res.and_then(|()| Err(eyre!("token service exited")))
        },
    };

    shutdown(exit_reason, service).await
}

#[instrument(skip_all)]
async fn shutdown(reason: eyre::Result<&str>, service: TokenService) -> ExitCode {
    let exit_code = match reason {
        Ok(reason) => {
            info!(reason, "shutting down");
            if let Err(e) = service.shutdown().await {
                warn!(%e, "shutting down");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "token service exited unexpectedly");
            ExitCode::FAILURE
        }
    };
    info!("shutdown successful");
    exit_code
}
