//! Tracing initialisation.
//!
//! `RUST_LOG` wins when set, so operators can narrow filters per module
//! (`RUST_LOG=ae_pipeline::relay=debug`); otherwise `application.log_level`
//! applies to everything.

use crate::config::{ApplicationConfig, LogFormat};
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter used by [`init_from_config`].
pub fn env_filter(config: &ApplicationConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install the global tracing subscriber described by the configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_from_config(config: &ApplicationConfig) -> Result<()> {
    let filter = env_filter(config);
    let result = match config.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialise tracing: {}", e))
}
