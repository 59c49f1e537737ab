//! Process-wide `tracing` subscriber.

use anyhow::anyhow;
use sealgate_core::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` wins when set, otherwise `level`, falling
/// back to `info` when `level` is not a valid directive.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}
