//! Tracing setup for the receiver.
//!
//! Uses `tracing-subscriber` with:
//! - an `EnvFilter` (`RUST_LOG` wins over the configured level)
//! - pretty, compact or JSON output
//! - idempotent initialisation, so tests and embedding applications may call
//!   [`init`] more than once
//!
//! Levels used across the crate: per-packet events are `trace!`, per-frame
//! events `debug!`, lifecycle `info!`, loss and malformed input `warn!`, fatal
//! socket errors `error!`.
//!
//! # Example
//! ```no_run
//! use frame_receiver::{config::ReceiverConfig, tracing_init};
//!
//! let config = ReceiverConfig::load_from("config/frame_receiver.toml")?;
//! tracing_init::init_from_config(&config)?;
//! tracing::info!(port = config.rx_port, "Receiver configured");
//! # Ok::<(), frame_receiver::ReceiverError>(())
//! ```

use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, ReceiverResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed with colors (development).
    Pretty,
    /// Single-line without colors.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(ReceiverError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events.
    pub with_span_events: bool,
    /// Include file and line numbers.
    pub with_file_and_line: bool,
    /// Include thread names (the receive thread is named `frame-rx`).
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Tracing settings derived from the receiver configuration.
    pub fn from_receiver_config(config: &ReceiverConfig) -> ReceiverResult<Self> {
        Ok(Self::new(parse_log_level(&config.log_level)?))
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise tracing from the receiver configuration.
pub fn init_from_config(config: &ReceiverConfig) -> ReceiverResult<()> {
    init(TracingConfig::from_receiver_config(config)?)
}

/// Initialise tracing.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`.
pub fn init(config: TracingConfig) -> ReceiverResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    let result = tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init();

    match result {
        Ok(()) => Ok(()),
        // Already initialised by a test harness or the embedding application
        Err(e) if e.to_string().contains("global default trace dispatcher") => Ok(()),
        Err(e) => Err(ReceiverError::Configuration(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

/// Parse a textual log level (case-insensitive).
pub fn parse_log_level(level: &str) -> ReceiverResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ReceiverError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_from_receiver_config() {
        let config = ReceiverConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let tracing_config = TracingConfig::from_receiver_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
    }

    #[test]
    fn test_builder_and_format_parse() {
        let config = TracingConfig::new(Level::WARN)
            .with_format("json".parse().unwrap())
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init(TracingConfig::default()).is_ok());
        assert!(init(TracingConfig::default()).is_ok());
    }
}
