//! Configuration loading.
//!
//! Settings come from an optional TOML file with environment overrides on
//! top, e.g. `FAULTWATCH__DEBUG=true` or `FAULTWATCH__FATAL__FLUSH_THRESHOLD=8192`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Severity;
use crate::scanner::{DEFAULT_FLUSH_THRESHOLD, DEFAULT_GUARD_BYTES};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FAULTWATCH";

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] ConfigError),

    /// The configuration file path is invalid.
    #[error("invalid configuration path: {0}")]
    InvalidPath(String),

    /// A conversion mask entry names no known severity.
    #[error("unknown severity in conversion mask: {0}")]
    UnknownSeverity(String),
}

/// Recoverable-signal conversion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub enabled: bool,
    /// Severity names; `None` selects the default mask.
    pub mask: Option<Vec<String>>,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mask: None,
        }
    }
}

/// Fatal-capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FatalSettings {
    pub enabled: bool,
    pub flush_threshold: usize,
    pub guard_buffer_kib: usize,
}

impl Default for FatalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            guard_buffer_kib: DEFAULT_GUARD_BYTES / 1024,
        }
    }
}

impl FatalSettings {
    pub fn guard_bytes(&self) -> usize {
        self.guard_buffer_kib.saturating_mul(1024)
    }
}

/// Transport for operator notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Emit a `warn` event under `faultwatch::notify`.
    Log,
    /// Pipe the message to `sendmail -t`.
    Sendmail,
}

impl FromStr for NotifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(NotifierKind::Log),
            "sendmail" => Ok(NotifierKind::Sendmail),
            other => Err(format!("unknown notifier '{}' (expected log or sendmail)", other)),
        }
    }
}

impl fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifierKind::Log => write!(f, "log"),
            NotifierKind::Sendmail => write!(f, "sendmail"),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub debug: bool,
    pub notify: Vec<String>,
    /// Notification transport; `None` keeps the pipeline's current one.
    pub notifier: Option<NotifierKind>,
    /// Program used by the sendmail transport.
    pub sendmail_program: Option<String>,
    pub message_file: Option<PathBuf>,
    pub exception_handling: bool,
    pub conversion: ConversionSettings,
    pub fatal: FatalSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            notify: Vec::new(),
            notifier: None,
            sendmail_program: None,
            message_file: None,
            exception_handling: true,
            conversion: ConversionSettings::default(),
            fatal: FatalSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given) with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, the path is not valid
    /// unicode, or the merged configuration does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let path_str = path
                .to_str()
                .ok_or_else(|| SettingsError::InvalidPath(format!("{:?}", path)))?;
            if !path.exists() {
                return Err(SettingsError::FileNotFound(path_str.to_string()));
            }
            builder = builder.add_source(File::with_name(path_str));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        tracing::debug!(?settings, "settings loaded");
        Ok(settings)
    }

    /// Resolves the configured conversion mask. `None` means the default mask.
    pub fn conversion_mask(&self) -> Result<Option<Severity>, SettingsError> {
        let Some(names) = &self.conversion.mask else {
            return Ok(None);
        };
        names
            .iter()
            .try_fold(Severity::empty(), |mask, name| {
                Severity::from_name(name)
                    .map(|severity| mask | severity)
                    .ok_or_else(|| SettingsError::UnknownSeverity(name.clone()))
            })
            .map(Some)
    }
}
