//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::EnvFilter;

/// Overrides `logging.level` when set
pub const LOG_ENV: &str = "VERITY_LOG";

/// Filter from [`LOG_ENV`], falling back to the configured level
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .map_err(|err| eyre!("{LOG_ENV}=`{directives}` is not a valid filter: {err}")),
        _ => EnvFilter::try_new(&config.level)
            .map_err(|err| eyre!("logging.level `{}` is not a valid filter: {err}", config.level)),
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|err| eyre!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used() {
        let config = LoggingConfig {
            level: "verity_replay=debug,warn".to_string(),
            json: false,
        };
        if std::env::var(LOG_ENV).is_err() {
            assert!(filter(&config).is_ok());
        }
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "verity=loudest".to_string(),
            json: true,
        };
        if std::env::var(LOG_ENV).is_err() {
            assert!(filter(&config).is_err());
        }
    }
}
