//! Tracing subscriber setup.
//!
//! The configured level is the default filter; `RUST_LOG` overrides it.
//! Output goes to stderr, or appended to the configured log file.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Build the event filter for `config`.
pub fn filter_for(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = filter_for(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig {
            level: "glacier=loudest".to_string(),
            file: None,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(filter_for(&config), Err(LoggingError::Filter { .. })));
        }
    }

    #[test]
    fn test_default_level_parses() {
        assert!(filter_for(&LoggingConfig::default()).is_ok());
    }
}
