//! tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

use twinsync_core::config::LoggingConfig;

/// Builds the filter: `RUST_LOG` if set and valid, else the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Installs the global fmt subscriber, optionally emitting JSON lines
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
