use anyhow::{anyhow, Result};
use invoicey_core::config::{LogFormat, LoggingConfig};
use tracing::Level;

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let log_level = parse_level(&config.level);
    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(log_level);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))
}

fn parse_level(raw: &str) -> Level {
    raw.parse::<Level>().unwrap_or(Level::INFO)
}
