//! Logging setup for greenroomd.
//!
//! stdout carries the transport, so log lines go to stderr.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `log_level`.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level '{}'", log_level))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(log_level, "logging initialized");
    Ok(())
}
