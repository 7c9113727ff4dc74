//! Session-scoped handler registry.
//!
//! [`HandlerRegistry`] owns the [`HandlerState`] of one session and is the
//! single object a host talks to: it receives recoverable signals through
//! [`on_signal`](HandlerRegistry::on_signal), flushed output through its
//! [`FlushStage`] implementation, and uncaught faults through
//! [`handle_uncaught`](HandlerRegistry::handle_uncaught).

mod host;
mod state;

pub use host::{HostRuntime, InProcessHost};
pub use state::{FacilityState, HandlerState};

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{
    panic, CanonicalError, Classification, ErrorClassifier, ExceptionNormalizer, FatalPattern,
    RawSignal, Severity,
};
use crate::pipeline::{
    Delivery, ExceptionPipeline, LogNotifier, ResponseSink, SendmailNotifier, DEFAULT_SENDMAIL,
};
use crate::scanner::{
    FatalHandler, FlushOutcome, FlushStage, OutputScanner, SessionMarker, DEFAULT_FLUSH_THRESHOLD,
    DEFAULT_GUARD_BYTES,
};
use crate::settings::{NotifierKind, Settings, SettingsError};

/// Errors from registry configuration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The host cannot route its output through an interposition stage.
    #[error("host runtime does not support output interposition")]
    OutputInterpositionUnsupported,

    /// The fatal diagnostic pattern could not be built for the session marker.
    #[error("failed to build fatal diagnostic pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Settings could not be applied.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Handler configuration and entry points for one session.
pub struct HandlerRegistry<H: HostRuntime = InProcessHost> {
    state: HandlerState,
    host: H,
    pipeline: ExceptionPipeline,
    scanner: Option<OutputScanner>,
    fatal_handler: Option<Box<dyn FatalHandler>>,
    flush_threshold: usize,
    guard_bytes: usize,
    captured_fatals: usize,
}

impl<H: HostRuntime> std::fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("state", &self.state)
            .field("scanner", &self.scanner)
            .field("has_fatal_handler", &self.fatal_handler.is_some())
            .field("flush_threshold", &self.flush_threshold)
            .field("guard_bytes", &self.guard_bytes)
            .field("captured_fatals", &self.captured_fatals)
            .finish_non_exhaustive()
    }
}

impl<H: HostRuntime> HandlerRegistry<H> {
    /// Creates a registry with every facility disabled and the default pipeline.
    pub fn new(host: H) -> Self {
        Self {
            state: HandlerState::default(),
            host,
            pipeline: ExceptionPipeline::default(),
            scanner: None,
            fatal_handler: None,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            guard_bytes: DEFAULT_GUARD_BYTES,
            captured_fatals: 0,
        }
    }

    /// Creates a registry and applies `settings` to it.
    pub fn from_settings(host: H, settings: &Settings) -> Result<Self> {
        let mut registry = Self::new(host);
        registry.apply_settings(settings)?;
        Ok(registry)
    }

    pub fn with_pipeline(mut self, pipeline: ExceptionPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Flush threshold used by the interposer. Takes effect for any
    /// interposer created afterwards.
    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes.max(1);
        self
    }

    /// Guard buffer size reserved when fatal capture is enabled.
    pub fn with_guard_bytes(mut self, bytes: usize) -> Self {
        self.guard_bytes = bytes;
        self
    }

    // ==================== Facilities ====================

    /// Sets the conversion mask and installs the classifier.
    ///
    /// The mask is replaced on every call; installation happens once.
    pub fn enable_error_conversion(&mut self, mask: Option<Severity>) -> bool {
        self.state.conversion_mask = mask.unwrap_or_default();
        if self.state.conversion.enable() {
            tracing::debug!(mask = ?self.state.conversion_mask, "error conversion enabled");
        }
        true
    }

    /// Installs the pipeline as the uncaught-fault sink.
    pub fn enable_exception_handling(&mut self) -> bool {
        if self.state.exception_handling.enable() {
            panic::install_hook();
            tracing::debug!("exception handling enabled");
        }
        true
    }

    /// Starts fatal capture for this session.
    ///
    /// Generates the session marker, has the host append it to its
    /// diagnostics, reserves the guard buffer and installs the scanner.
    /// A second call changes nothing.
    ///
    /// # Errors
    ///
    /// Fails without touching any state if the host has no output
    /// interposition stage.
    pub fn enable_fatal_error_handling(&mut self) -> Result<()> {
        if self.state.fatal_capture.is_enabled() {
            return Ok(());
        }
        if !self.host.supports_output_interposition() {
            return Err(RegistryError::OutputInterpositionUnsupported);
        }

        let marker = SessionMarker::generate();
        let pattern = FatalPattern::for_marker(marker.as_str())?;
        self.host.append_diagnostic_suffix(&marker.suffix());
        self.scanner = Some(OutputScanner::new(pattern, self.guard_bytes));

        tracing::info!(
            marker = %marker,
            guard_bytes = self.guard_bytes,
            flush_threshold = self.flush_threshold,
            "fatal error capture enabled"
        );
        self.state.session_marker = Some(marker);
        self.state.fatal_capture.enable();
        Ok(())
    }

    /// Registers a custom handler for captured fatals and enables capture.
    ///
    /// # Errors
    ///
    /// Fails without storing the handler when fatal capture cannot be enabled.
    pub fn set_fatal_error_handler(&mut self, handler: impl FatalHandler + 'static) -> Result<()> {
        self.enable_fatal_error_handling()?;
        self.fatal_handler = Some(Box::new(handler));
        Ok(())
    }

    // ==================== Setters ====================

    /// Replaces the notification targets.
    ///
    /// Addresses that are empty or lack an `@` are dropped with a warning.
    /// Returns the first warning raised through conversion, if any.
    pub fn set_notify_targets<I, S>(&mut self, targets: I) -> std::result::Result<(), CanonicalError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut valid: Vec<String> = Vec::new();
        let mut rejected: Vec<String> = Vec::new();
        for target in targets {
            let target: String = target.into();
            let target = target.trim().to_string();
            if target.is_empty() || !target.contains('@') {
                rejected.push(target);
            } else if !valid.contains(&target) {
                valid.push(target);
            }
        }
        self.state.notify_targets = valid;

        let mut outcome = Ok(());
        for target in rejected {
            let raised = self.report_internal(format!("invalid notification address '{}'", target));
            if outcome.is_ok() {
                outcome = raised;
            }
        }
        outcome
    }

    /// Sets the static message file shown to end users in production.
    ///
    /// The path is stored even when unreadable; in that case a warning is
    /// routed through [`on_signal`](Self::on_signal) and its result returned.
    pub fn set_message_file(&mut self, path: impl Into<PathBuf>) -> std::result::Result<(), CanonicalError> {
        let path = path.into();
        let readable = std::fs::File::open(&path)
            .and_then(|file| file.metadata())
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        let display = path.display().to_string();
        self.state.message_file = Some(path);

        if readable {
            Ok(())
        } else {
            self.report_internal(format!("message file '{}' is not readable", display))
        }
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.state.debug_mode = enabled;
    }

    /// Applies loaded settings.
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<()> {
        self.set_debug_mode(settings.debug);
        self.flush_threshold = settings.fatal.flush_threshold.max(1);
        self.guard_bytes = settings.fatal.guard_bytes();

        if settings.conversion.enabled {
            self.enable_error_conversion(settings.conversion_mask()?);
        }
        if settings.exception_handling {
            self.enable_exception_handling();
        }
        match settings.notifier {
            Some(NotifierKind::Log) => self.pipeline.set_notifier(LogNotifier),
            Some(NotifierKind::Sendmail) => {
                let program = settings.sendmail_program.as_deref().unwrap_or(DEFAULT_SENDMAIL);
                self.pipeline.set_notifier(SendmailNotifier::new(program));
            }
            None => {}
        }
        if let Err(error) = self.set_notify_targets(settings.notify.iter().cloned()) {
            tracing::debug!(%error, "notification address warning raised during configuration");
        }
        if let Some(path) = &settings.message_file {
            if let Err(error) = self.set_message_file(path.clone()) {
                tracing::debug!(%error, "message file warning raised during configuration");
            }
        }
        if settings.fatal.enabled {
            self.enable_fatal_error_handling()?;
        }
        Ok(())
    }

    // ==================== Host Entry Points ====================

    /// Recoverable-signal channel.
    ///
    /// `Ok(())` tells the host to carry on; `Err` is the error to raise into
    /// the calling context.
    pub fn on_signal(&self, signal: RawSignal) -> std::result::Result<(), CanonicalError> {
        if !self.state.conversion.is_enabled() {
            return Ok(());
        }
        match ErrorClassifier::new(self.state.conversion_mask).classify(&signal) {
            Classification::Suppressed => Ok(()),
            Classification::Convert(error) => Err(error),
        }
    }

    /// Handles an error through the pipeline regardless of facility state.
    pub fn handle(&self, error: CanonicalError, delivery: Delivery<'_>) -> Option<String> {
        self.pipeline.handle(&self.state, error, delivery)
    }

    /// Uncaught-fault sink. Returns false, without handling, when exception
    /// handling is disabled.
    pub fn handle_uncaught(&self, error: CanonicalError, sink: &mut dyn ResponseSink) -> bool {
        if !self.state.exception_handling.is_enabled() {
            return false;
        }
        self.pipeline.handle(&self.state, error, Delivery::Emit(sink));
        true
    }

    /// Runs `f` and routes a panic to [`handle_uncaught`](Self::handle_uncaught).
    ///
    /// Returns `None` if `f` panicked. With exception handling disabled the
    /// panic is not caught.
    pub fn run_guarded<T>(&self, sink: &mut dyn ResponseSink, f: impl FnOnce() -> T) -> Option<T> {
        if !self.state.exception_handling.is_enabled() {
            return Some(f());
        }
        match panic::catch(f) {
            Ok(value) => Some(value),
            Err(error) => {
                self.handle_uncaught(error, sink);
                None
            }
        }
    }

    /// Faults in the reporting machinery: always logged, then classified as
    /// a warning located at the caller.
    #[track_caller]
    fn report_internal(&self, message: String) -> std::result::Result<(), CanonicalError> {
        let signal = ExceptionNormalizer::internal_warning(message);
        tracing::warn!(file = %signal.file, line = signal.line, "{}", signal.message);
        self.on_signal(signal)
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn marker(&self) -> Option<&SessionMarker> {
        self.state.session_marker()
    }

    /// Bytes currently held by the guard buffer; 0 before fatal capture.
    pub fn guard_reserved_bytes(&self) -> usize {
        self.scanner
            .as_ref()
            .map_or(0, |scanner| scanner.guard().reserved_bytes())
    }

    pub fn has_fatal_handler(&self) -> bool {
        self.fatal_handler.is_some()
    }

    /// Fatal diagnostics captured from output so far.
    pub fn captured_fatals(&self) -> usize {
        self.captured_fatals
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

impl<H: HostRuntime> FlushStage for HandlerRegistry<H> {
    fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    fn on_flush(&mut self, chunk: &[u8]) -> FlushOutcome {
        let Self {
            state,
            pipeline,
            scanner,
            fatal_handler,
            captured_fatals,
            ..
        } = self;

        let Some(scanner) = scanner.as_mut() else {
            return FlushOutcome::Forward;
        };

        scanner.scan(chunk, |error, raw| {
            *captured_fatals += 1;
            match fatal_handler.as_mut() {
                Some(handler) => handler.handle(&error, raw),
                None => {
                    let body = pipeline
                        .handle(state, error, Delivery::Return)
                        .unwrap_or_default();
                    FlushOutcome::Suppress(body.into_bytes())
                }
            }
        })
    }
}
