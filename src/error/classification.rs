//! Canonical error types and the recoverable-signal classifier.
//!
//! Every fault that reaches the handling pipeline is first turned into a
//! [`CanonicalError`], whether it started life as a recoverable runtime
//! diagnostic, as text scraped from the output stream, or as a caught panic.
//! The [`ErrorClassifier`] decides which recoverable signals deserve that
//! treatment.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::normalizer::ExceptionNormalizer;

bitflags! {
    /// Kinds of diagnostic signals a hosted runtime can raise.
    ///
    /// The bit values follow the conventional runtime diagnostic levels so
    /// that masks written for the host can be reused verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Severity: u32 {
        const ERROR = 1;
        const WARNING = 1 << 1;
        const PARSE = 1 << 2;
        const NOTICE = 1 << 3;
        const CORE_ERROR = 1 << 4;
        const CORE_WARNING = 1 << 5;
        const COMPILE_ERROR = 1 << 6;
        const COMPILE_WARNING = 1 << 7;
        const USER_ERROR = 1 << 8;
        const USER_WARNING = 1 << 9;
        const USER_NOTICE = 1 << 10;
        const STRICT = 1 << 11;
        const RECOVERABLE_ERROR = 1 << 12;
        const DEPRECATED = 1 << 13;
        const USER_DEPRECATED = 1 << 14;
    }
}

/// Config name and display label for each single severity bit.
const SEVERITY_NAMES: &[(Severity, &str, &str)] = &[
    (Severity::ERROR, "error", "Fatal error"),
    (Severity::WARNING, "warning", "Warning"),
    (Severity::PARSE, "parse", "Parse error"),
    (Severity::NOTICE, "notice", "Notice"),
    (Severity::CORE_ERROR, "core_error", "Fatal error"),
    (Severity::CORE_WARNING, "core_warning", "Warning"),
    (Severity::COMPILE_ERROR, "compile_error", "Fatal error"),
    (Severity::COMPILE_WARNING, "compile_warning", "Warning"),
    (Severity::USER_ERROR, "user_error", "Fatal error"),
    (Severity::USER_WARNING, "user_warning", "Warning"),
    (Severity::USER_NOTICE, "user_notice", "Notice"),
    (Severity::STRICT, "strict", "Strict Standards"),
    (Severity::RECOVERABLE_ERROR, "recoverable_error", "Catchable fatal error"),
    (Severity::DEPRECATED, "deprecated", "Deprecated"),
    (Severity::USER_DEPRECATED, "user_deprecated", "Deprecated"),
];

impl Severity {
    /// Mask used when conversion is enabled without an explicit mask:
    /// everything except the style and notice levels.
    pub const DEFAULT_CONVERSION: Severity = Severity::all().difference(
        Severity::STRICT
            .union(Severity::NOTICE)
            .union(Severity::USER_NOTICE),
    );

    /// Levels after which the runtime cannot continue. These never travel
    /// the recoverable-signal channel.
    pub const FATAL: Severity = Severity::ERROR
        .union(Severity::PARSE)
        .union(Severity::CORE_ERROR)
        .union(Severity::COMPILE_ERROR);

    /// True when any bit of `self` is a fatal level.
    pub fn is_fatal(&self) -> bool {
        self.intersects(Severity::FATAL)
    }

    /// Looks up a severity by its config name (`"warning"`, `"user_notice"`, `"all"`).
    pub fn from_name(name: &str) -> Option<Severity> {
        let name = name.trim().to_ascii_lowercase();
        if name == "all" {
            return Some(Severity::all());
        }
        SEVERITY_NAMES
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(s, _, _)| *s)
    }

    /// Looks up a severity by the label a runtime prints in front of a
    /// diagnostic (`"Warning"`, `"Fatal error"`). The first matching level wins.
    pub fn from_label(label: &str) -> Option<Severity> {
        let label = label.trim();
        SEVERITY_NAMES
            .iter()
            .find(|(_, _, l)| l.eq_ignore_ascii_case(label))
            .map(|(s, _, _)| *s)
    }

    /// Human-readable label for a single severity. Combined masks read as `"Error"`.
    pub fn label(&self) -> &'static str {
        SEVERITY_NAMES
            .iter()
            .find(|(s, _, _)| s == self)
            .map(|(_, _, l)| *l)
            .unwrap_or("Error")
    }

    /// Config name for a single severity.
    pub fn name(&self) -> Option<&'static str> {
        SEVERITY_NAMES
            .iter()
            .find(|(s, _, _)| s == self)
            .map(|(_, n, _)| *n)
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::DEFAULT_CONVERSION
    }
}

/// Whether the faulting program can keep going after the error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Raised back into the caller's control flow.
    Recoverable,
    /// The program is terminating; the error is only reported.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Recoverable => write!(f, "recoverable"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Source position of a fault.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    /// File path as reported by the runtime.
    pub file: String,
    /// 1-based line number; 0 when unknown.
    pub line: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One entry of a call trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}({})", file, line)?,
            (Some(file), None) => write!(f, "{}", file)?,
            _ => write!(f, "[internal]")?,
        }
        if let Some(function) = &self.function {
            write!(f, ": {}", function)?;
        }
        Ok(())
    }
}

/// The single error representation every handling path consumes.
///
/// Built by [`ExceptionNormalizer`]; there are no setters, so a value is
/// immutable once handed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CanonicalError {
    kind: ErrorKind,
    severity: Severity,
    message: String,
    #[serde(flatten)]
    location: Location,
    trace: Vec<Frame>,
    #[serde(skip)]
    captured_text: Option<String>,
}

impl CanonicalError {
    /// Creates an error without trace or captured text.
    pub fn new(
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            location,
            trace: Vec::new(),
            captured_text: None,
        }
    }

    /// Attaches a call trace.
    pub fn with_trace(mut self, trace: Vec<Frame>) -> Self {
        self.trace = trace;
        self
    }

    /// Attaches the raw output chunk the error was scraped from.
    pub fn with_captured_text(mut self, text: impl Into<String>) -> Self {
        self.captured_text = Some(text.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn file(&self) -> &str {
        &self.location.file
    }

    pub fn line(&self) -> u32 {
        self.location.line
    }

    pub fn trace(&self) -> &[Frame] {
        &self.trace
    }

    pub fn captured_text(&self) -> Option<&str> {
        self.captured_text.as_deref()
    }

    /// Returns true if the error was scraped from the output stream.
    pub fn is_captured(&self) -> bool {
        self.captured_text.is_some()
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// Title used by renderers and notification subjects.
    pub fn title(&self) -> &'static str {
        self.severity.label()
    }

    /// Renders the trace the way runtimes print it, one `#n` line per frame.
    pub fn trace_as_string(&self) -> String {
        self.trace
            .iter()
            .enumerate()
            .map(|(i, frame)| format!("#{} {}", i, frame))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in {} on line {}",
            self.title(),
            self.message,
            self.location.file,
            self.location.line
        )
    }
}

impl std::error::Error for CanonicalError {}

/// A recoverable diagnostic as the host reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSignal {
    pub kind: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    /// The call site silenced diagnostics for this one operation.
    pub suppressed: bool,
}

impl RawSignal {
    pub fn new(kind: Severity, message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            file: file.into(),
            line,
            suppressed: false,
        }
    }

    /// Marks the signal as explicitly silenced by its call site.
    pub fn silenced(mut self) -> Self {
        self.suppressed = true;
        self
    }
}

/// Outcome of classifying a recoverable signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Ignore the signal; the host continues normally.
    Suppressed,
    /// Raise the canonical error into the calling context.
    Convert(CanonicalError),
}

impl Classification {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Classification::Suppressed)
    }
}

/// Decides which recoverable signals become canonical errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorClassifier {
    mask: Severity,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Severity::DEFAULT_CONVERSION)
    }
}

impl ErrorClassifier {
    pub fn new(mask: Severity) -> Self {
        Self { mask }
    }

    pub fn mask(&self) -> Severity {
        self.mask
    }

    /// The pure decision: silenced call sites and kinds outside the mask are dropped.
    pub fn should_convert(&self, kind: Severity, suppressed: bool) -> bool {
        !suppressed && kind.intersects(self.mask)
    }

    /// Classifies a signal, normalizing it when it has to be converted.
    pub fn classify(&self, signal: &RawSignal) -> Classification {
        if self.should_convert(signal.kind, signal.suppressed) {
            Classification::Convert(ExceptionNormalizer::from_signal(signal))
        } else {
            Classification::Suppressed
        }
    }
}
