//! Builders for [`CanonicalError`] values.
//!
//! Each detection path hands its raw material to one of the constructors
//! here, so that kind, severity and location are filled in the same way
//! no matter where a fault was observed.

use std::any::Any;

use super::classification::{CanonicalError, ErrorKind, Frame, Location, RawSignal, Severity};
use super::detector::FatalCapture;

/// Frames from these crates belong to the unwinding machinery, not the program.
const RUNTIME_FRAME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "rust_begin_unwind",
    "__rust",
    "<alloc::",
    "<core::",
    "<std::",
];

/// Namespace for the canonical error constructors.
pub struct ExceptionNormalizer;

impl ExceptionNormalizer {
    /// Converts a recoverable signal, keeping its kind, message and location verbatim.
    pub fn from_signal(signal: &RawSignal) -> CanonicalError {
        CanonicalError::new(
            ErrorKind::Recoverable,
            signal.kind,
            signal.message.clone(),
            Location::new(signal.file.clone(), signal.line),
        )
    }

    /// Converts a fatal-level diagnostic reported out of band, such as on a
    /// child's stderr. Kind is always [`ErrorKind::Fatal`].
    pub fn from_fatal_signal(signal: &RawSignal) -> CanonicalError {
        CanonicalError::new(
            ErrorKind::Fatal,
            signal.kind,
            signal.message.clone(),
            Location::new(signal.file.clone(), signal.line),
        )
    }

    /// Builds a fatal error from fields the output scanner extracted.
    pub fn from_capture(capture: FatalCapture, chunk: &str) -> CanonicalError {
        CanonicalError::new(
            ErrorKind::Fatal,
            capture.severity,
            capture.message,
            Location::new(capture.file, capture.line),
        )
        .with_trace(capture.trace)
        .with_captured_text(chunk)
    }

    /// Builds a fatal error from a caught panic payload.
    ///
    /// `location` and `backtrace` come from the panic hook when one was
    /// installed; without them the error points at an unknown location.
    pub fn from_panic(
        payload: &(dyn Any + Send),
        location: Option<Location>,
        backtrace: Option<&str>,
    ) -> CanonicalError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };

        CanonicalError::new(
            ErrorKind::Fatal,
            Severity::ERROR,
            message,
            location.unwrap_or_else(|| Location::new("<unknown>", 0)),
        )
        .with_trace(backtrace.map(parse_backtrace).unwrap_or_default())
    }

    /// Builds a fatal error for a hosted program that terminated abnormally.
    pub fn from_exit(program: &str, code: Option<i32>, signal: Option<i32>) -> CanonicalError {
        let message = match (code, signal) {
            (_, Some(sig)) => format!("process terminated by signal {}", sig),
            (Some(code), None) => format!("process exited with status {}", code),
            (None, None) => "process terminated abnormally".to_string(),
        };
        CanonicalError::new(
            ErrorKind::Fatal,
            Severity::CORE_ERROR,
            message,
            Location::new(program, 0),
        )
    }

    /// Describes a fault in the reporting machinery as a warning-level signal
    /// located at the caller.
    #[track_caller]
    pub fn internal_warning(message: impl Into<String>) -> RawSignal {
        let caller = std::panic::Location::caller();
        RawSignal::new(Severity::WARNING, message, caller.file(), caller.line())
    }
}

/// Turns a rendered `std::backtrace::Backtrace` into frames, dropping the
/// unwinding machinery.
pub(crate) fn parse_backtrace(text: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut keep_last = false;

    for line in text.lines().map(str::trim) {
        if let Some(at) = line.strip_prefix("at ") {
            if keep_last {
                if let Some(frame) = frames.last_mut() {
                    let (file, line_no) = split_source_position(at);
                    frame.file = Some(file.to_string());
                    frame.line = line_no;
                }
            }
            continue;
        }

        let Some((index, function)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        keep_last = !RUNTIME_FRAME_PREFIXES
            .iter()
            .any(|prefix| function.starts_with(prefix));
        if keep_last {
            frames.push(Frame {
                function: Some(function.to_string()),
                file: None,
                line: None,
            });
        }
    }

    frames
}

/// Splits `path:line:column` into the path and the line number.
fn split_source_position(position: &str) -> (&str, Option<u32>) {
    let mut parts = position.rsplitn(3, ':');
    let column = parts.next();
    let line = parts.next();
    match (parts.next(), line, column) {
        (Some(file), Some(line), Some(_)) => (file, line.parse().ok()),
        _ => (position, None),
    }
}
