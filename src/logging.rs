//! Tracing subscriber setup for the binaries.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// Fails if a subscriber is already installed.
pub fn init_from_config(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = build_filter(config);
    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_falls_back_to_config_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert_eq!(build_filter(&config).to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_takes_precedence() {
        std::env::set_var("RUST_LOG", "seifert_xray=trace");
        let filter = build_filter(&LoggingConfig::default());
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "seifert_xray=trace");
    }
}
