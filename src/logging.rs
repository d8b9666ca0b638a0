//! Logging setup
//!
//! Installs a `tracing` subscriber with:
//! - an `EnvFilter` from `RUST_LOG`, defaulting to `muni_assist_sdk=info`
//! - a stderr layer, plain or JSON
//! - an optional daily rolling log file (non-blocking writer)
//!
//! Keep the returned [`LoggingGuard`] alive for the life of the process, or
//! buffered file output is lost.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub default_directive: String,
    /// Emit JSON lines on stderr instead of human-readable output
    pub json: bool,
    /// Directory for the rolling log file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// File name prefix inside `log_dir`
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "muni_assist_sdk=info".to_string(),
            json: false,
            log_dir: None,
            file_prefix: "muni-assist.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }
}

/// Flushes the file writer when dropped
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .with_context(|| format!("invalid log filter '{}'", config.default_directive))?;

    let plain = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let json = config
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!("[Logging] Initialized (json: {}, file: {:?})", config.json, config.log_dir);
    Ok(LoggingGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_directive, "muni_assist_sdk=info");
        assert!(!config.json);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_builders() {
        let config = LoggingConfig::default()
            .with_json(true)
            .with_log_dir("/tmp/logs")
            .with_default_directive("debug");
        assert!(config.json);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.default_directive, "debug");
    }
}
