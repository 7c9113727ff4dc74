//! Diagnostic logging for faultwatch itself.
//!
//! Everything goes to stderr: stdout carries the hosted program's response
//! and must only ever contain the response or its replacement page.
//! `RUST_LOG` takes precedence over the configured level.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Verbosity of faultwatch's own logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    /// Default: captured faults and reporting failures only.
    #[default]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            // Off is handled by the filter directive
            LogLevel::Error | LogLevel::Off => Level::ERROR,
        }
    }
}

impl From<u8> for LogLevel {
    /// 0 = Warn, 1 = Info, 2 = Debug, 3+ = Trace
    fn from(verbosity: u8) -> Self {
        match verbosity {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub with_timestamps: bool,
    /// Include the module path; useful to tell `faultwatch::report` records
    /// apart from the crate's own events.
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            with_timestamps: true,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.with_timestamps = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self
    }

    pub fn with_line_number(mut self, enabled: bool) -> Self {
        self.with_line_number = enabled;
        self
    }

    /// Configuration for a `-v` count. From `-vv` on, events carry their
    /// source position too.
    pub fn from_verbosity(verbosity: u8) -> Self {
        Self::default()
            .with_level(LogLevel::from(verbosity))
            .with_file(verbosity >= 2)
            .with_line_number(verbosity >= 2)
    }

    fn env_filter(&self) -> EnvFilter {
        if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(self.level.directive())
        }
    }
}

/// Installs the global subscriber.
///
/// Returns false if a subscriber was already installed, which is harmless:
/// the first configuration stays in effect.
///
/// # Examples
///
/// ```no_run
/// use faultwatch::logging::{init_logging, LoggingConfig, LogLevel};
///
/// init_logging(LoggingConfig::new().with_level(LogLevel::Debug));
/// ```
pub fn init_logging(config: LoggingConfig) -> bool {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(config.env_filter())
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number);

    let result = if config.with_timestamps {
        subscriber.try_init()
    } else {
        subscriber.without_time().try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(LogLevel::from(0), LogLevel::Warn);
        assert_eq!(LogLevel::from(1), LogLevel::Info);
        assert_eq!(LogLevel::from(2), LogLevel::Debug);
        assert_eq!(LogLevel::from(10), LogLevel::Trace);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_timestamps(false)
            .with_target(false)
            .with_thread_ids(true);

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.with_timestamps);
        assert!(!config.with_target);
        assert!(config.with_thread_ids);
    }

    #[test]
    fn test_from_verbosity_adds_source_position() {
        let quiet = LoggingConfig::from_verbosity(0);
        assert_eq!(quiet.level, LogLevel::Warn);
        assert!(!quiet.with_file);

        let loud = LoggingConfig::from_verbosity(2);
        assert_eq!(loud.level, LogLevel::Debug);
        assert!(loud.with_file);
        assert!(loud.with_line_number);
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_logging(LoggingConfig::new().with_level(LogLevel::Off));
        assert!(!init_logging(LoggingConfig::new()));
    }
}
