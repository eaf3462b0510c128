use std::process::ExitCode;

use clap::Parser as _;
use cli::Cli;
use tokens_core::config::Config;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("Failed to install error report handler: {err}");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    "sqlx=warn"
                        .parse()
                        .expect("well-formed tracing directive should parse"),
                )
                .add_directive(
                    "hyper_util=warn"
                        .parse()
                        .expect("well-formed tracing directive should parse"),
                ),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let command_jh = tokio::spawn(cli.run(config));

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal(SignalKind::terminate())
        .expect("setting sigterm listener on unix should always work");
    let mut sigint = signal(SignalKind::interrupt())
        .expect("setting sigint listener on unix should always work");

    // Wait for either command completion or interrupt signal
    select! {
        res = command_jh => match res {
            Ok(Ok(())) => {
                info!("command completed");
                ExitCode::SUCCESS
            }
            Ok(Err(e)) => {
                error!(error = ?e, "command failed");
                ExitCode::FAILURE
            }
            Err(e) => {
                error!(%e, "command exited unexpectedly");
                ExitCode::FAILURE
            }
        },
        _ = sigterm.recv() => {
            info!("received SIGTERM signal");
            ExitCode::FAILURE
        }
        _ = sigint.recv() => {
            info!("received SIGINT signal");
            ExitCode::FAILURE
        }
    }
}
