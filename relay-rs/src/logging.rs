//! Logging initialisation
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::config::LoggingConfig;
use crate::error::{RelayError, Result};
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber
///
/// # Arguments
/// * `config` - The `[logging]` section
/// * `level_override` - Level from the command line, if any
///
/// # Errors
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = filter_level(level_override.unwrap_or(&config.level));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = match &config.file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    RelayError::Config(format!("Cannot open log file {}: {}", path.display(), e))
                })?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(&config.format, file))
        .try_init()
        .map_err(|e| RelayError::Config(format!("Failed to set tracing subscriber: {}", e)))
}

/// Map a configured level onto an `EnvFilter` directive
pub fn filter_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

fn fmt_layer<S>(format: &str, file: Option<File>) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    match (format, file) {
        ("json", Some(file)) => Box::new(layer.json().with_ansi(false).with_writer(Mutex::new(file))),
        ("json", None) => Box::new(layer.json()),
        ("compact", Some(file)) => {
            Box::new(layer.compact().with_ansi(false).with_writer(Mutex::new(file)))
        }
        ("compact", None) => Box::new(layer.compact()),
        (_, Some(file)) => Box::new(layer.pretty().with_ansi(false).with_writer(Mutex::new(file))),
        (_, None) => Box::new(layer.pretty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_level() {
        assert_eq!(filter_level("DEBUG"), "debug");
        assert_eq!(filter_level("fatal"), "error");
        assert_eq!(filter_level("warning"), "warn");
        assert_eq!(filter_level("nonsense"), "info");
    }

    #[test]
    fn test_missing_log_directory_is_an_error() {
        let config = LoggingConfig {
            file: Some("/nonexistent/dir/relay.log".into()),
            ..LoggingConfig::default()
        };
        assert!(matches!(init(&config, None), Err(RelayError::Config(_))));
    }
}
