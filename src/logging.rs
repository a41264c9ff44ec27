//! Tracing subscriber setup

use crate::config::{Environment, LogFormat, LoggingConfig};
use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Filter in effect: `RUST_LOG` when set, else the configured level
pub fn env_filter(config: &LoggingConfig, environment: Environment) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.effective_level(environment);
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber
///
/// Returns false when one is already installed, which happens when tests
/// initialize logging more than once.
pub fn init(config: &LoggingConfig, environment: Environment) -> bool {
    let filter = env_filter(config, environment);
    let ansi = std::io::stderr().is_terminal();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_ansi(false).try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(environment = %environment, format = ?config.format, "Logging initialized");
    }
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        let config = LoggingConfig {
            level: Some("warn".to_string()),
            format: LogFormat::Compact,
        };

        init(&config, Environment::Test);
        assert!(!init(&config, Environment::Test));
    }
}
