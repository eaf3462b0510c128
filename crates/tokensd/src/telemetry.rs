//! Log output of the daemon: HTTP request spans, refresh runs and upstream
//! failures all go through one `fmt` subscriber.

use color_eyre::eyre::{self, WrapErr as _};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _};

/// Used when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVE: &str = "info";

/// Transport and driver crates kept at `warn`, whatever `RUST_LOG` asks for.
const NOISY_TARGETS: &[&str] = &[
    "h2",
    "hyper",
    "hyper_util",
    "reqwest",
    "sqlx",
    "alloy_transport_http",
];

fn env_filter() -> eyre::Result<EnvFilter> {
    let base =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    NOISY_TARGETS.iter().try_fold(base, |filter, target| {
        let directive = format!("{target}=warn")
            .parse()
            .wrap_err_with(|| format!("invalid log directive for {target}"))?;
        Ok(filter.add_directive(directive))
    })
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init() -> eyre::Result<()> {
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter()?)
        .with(fmt::layer().with_file(true).with_line_number(true));

    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("failed to install tracing subscriber")
}
