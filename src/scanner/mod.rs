//! Output-interposition stage.
//!
//! The [`OutputScanner`] looks at every flushed chunk of outbound output for
//! a marker-guarded fatal diagnostic. It is driven through the [`FlushStage`]
//! trait, which [`OutputInterposer`] calls as it buffers writes.
//!
//! A diagnostic that straddles two flushed chunks is not detected. Chunks are
//! scanned independently and no lookback window is kept.

mod guard;
mod interposer;
mod marker;

pub use guard::{GuardBuffer, Headroom, DEFAULT_GUARD_BYTES};
pub use interposer::OutputInterposer;
pub use marker::SessionMarker;

use crate::error::{CanonicalError, ExceptionNormalizer, FatalPattern};

/// Default number of buffered bytes that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4096;

/// What to do with a flushed chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Emit the chunk unchanged.
    Forward,
    /// Drop the chunk and emit this body instead.
    Suppress(Vec<u8>),
}

impl FlushOutcome {
    pub fn is_forward(&self) -> bool {
        matches!(self, FlushOutcome::Forward)
    }
}

/// Something that inspects output chunks as they are flushed.
pub trait FlushStage {
    /// Buffered bytes that trigger a flush.
    fn flush_threshold(&self) -> usize {
        DEFAULT_FLUSH_THRESHOLD
    }

    /// Called with each flushed chunk.
    fn on_flush(&mut self, chunk: &[u8]) -> FlushOutcome;
}

impl<S: FlushStage + ?Sized> FlushStage for &mut S {
    fn flush_threshold(&self) -> usize {
        (**self).flush_threshold()
    }

    fn on_flush(&mut self, chunk: &[u8]) -> FlushOutcome {
        (**self).on_flush(chunk)
    }
}

/// User-supplied handler for captured fatal diagnostics.
///
/// Receives the canonical error and the raw chunk it was found in, and
/// decides what the chunk turns into.
pub trait FatalHandler {
    fn handle(&mut self, error: &CanonicalError, raw: &[u8]) -> FlushOutcome;
}

impl<F> FatalHandler for F
where
    F: FnMut(&CanonicalError, &[u8]) -> FlushOutcome,
{
    fn handle(&mut self, error: &CanonicalError, raw: &[u8]) -> FlushOutcome {
        self(error, raw)
    }
}

/// Detects fatal diagnostics in flushed output for one session.
#[derive(Debug)]
pub struct OutputScanner {
    pattern: FatalPattern,
    guard: GuardBuffer,
}

impl OutputScanner {
    /// Creates a scanner and reserves its guard buffer.
    pub fn new(pattern: FatalPattern, guard_bytes: usize) -> Self {
        Self {
            pattern,
            guard: GuardBuffer::new(guard_bytes),
        }
    }

    pub fn guard(&self) -> &GuardBuffer {
        &self.guard
    }

    /// Scans one flushed chunk.
    ///
    /// The guard buffer is released for the whole body, dispatch included,
    /// and reserved again on the way out. On a match `dispatch` receives the
    /// canonical error and the raw chunk, and its outcome is returned as is.
    pub fn scan<D>(&mut self, chunk: &[u8], dispatch: D) -> FlushOutcome
    where
        D: FnOnce(CanonicalError, &[u8]) -> FlushOutcome,
    {
        let _headroom = self.guard.release();

        if !FatalPattern::probe(chunk) {
            return FlushOutcome::Forward;
        }

        let text = String::from_utf8_lossy(chunk);
        match self.pattern.detect(&text) {
            Some(capture) => {
                tracing::warn!(
                    file = %capture.file,
                    line = capture.line,
                    "fatal diagnostic captured from output"
                );
                let error = ExceptionNormalizer::from_capture(capture, &text);
                dispatch(error, chunk)
            }
            None => {
                tracing::debug!(
                    bytes = chunk.len(),
                    "error token without session marker, forwarding chunk"
                );
                FlushOutcome::Forward
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Severity};

    fn scanner() -> (OutputScanner, SessionMarker) {
        let marker = SessionMarker::generate();
        let pattern = FatalPattern::for_marker(marker.as_str()).unwrap();
        (OutputScanner::new(pattern, 4096), marker)
    }

    #[test]
    fn test_clean_chunk_is_forwarded_and_guard_kept() {
        let (mut scanner, _) = scanner();
        let mut dispatched = false;
        let outcome = scanner.scan(b"no trouble here", |_, _| {
            dispatched = true;
            FlushOutcome::Suppress(Vec::new())
        });
        assert_eq!(outcome, FlushOutcome::Forward);
        assert!(!dispatched);
        assert!(scanner.guard().is_reserved());
        assert_eq!(scanner.guard().reserved_bytes(), 4096);
    }

    #[test]
    fn test_marked_fatal_is_dispatched() {
        let (mut scanner, marker) = scanner();
        let chunk = format!("Fatal error: Foo in bar.php on line 123 {}", marker.suffix());
        let mut seen = None;
        let outcome = scanner.scan(chunk.as_bytes(), |error, raw| {
            seen = Some((error, raw.to_vec()));
            FlushOutcome::Suppress(b"replaced".to_vec())
        });
        assert_eq!(outcome, FlushOutcome::Suppress(b"replaced".to_vec()));

        let (error, raw) = seen.unwrap();
        assert_eq!(error.kind(), ErrorKind::Fatal);
        assert_eq!(error.severity(), Severity::ERROR);
        assert_eq!(error.message(), "Foo");
        assert_eq!(error.file(), "bar.php");
        assert_eq!(error.line(), 123);
        assert_eq!(error.captured_text(), Some(chunk.as_str()));
        assert_eq!(raw, chunk.as_bytes());
        assert!(scanner.guard().is_reserved());
    }

    #[test]
    fn test_false_alarm_is_forwarded() {
        let (mut scanner, _) = scanner();
        let outcome = scanner.scan(
            b"Fatal error: Foo in bar.php on line 123 [not-the-marker]",
            |_, _| panic!("must not dispatch"),
        );
        assert!(outcome.is_forward());
        assert!(scanner.guard().is_reserved());
    }

    #[test]
    fn test_parse_error_with_passthrough_keeps_guard() {
        let (mut scanner, marker) = scanner();
        let chunk = format!("Parse error: oops in a.php on line 1 {}", marker.suffix());
        let outcome = scanner.scan(chunk.as_bytes(), |error, _| {
            assert_eq!(error.severity(), Severity::PARSE);
            FlushOutcome::Forward
        });
        assert!(outcome.is_forward());
        assert!(scanner.guard().is_reserved());
    }

    #[test]
    fn test_parse_error_token_alone_is_forwarded() {
        let (mut scanner, marker) = scanner();
        let chunk = format!("<p>A parse error: means a typo.</p>{}", marker.suffix());
        let outcome = scanner.scan(chunk.as_bytes(), |_, _| panic!("must not dispatch"));
        assert!(outcome.is_forward());
        assert!(scanner.guard().is_reserved());
    }

    #[test]
    fn test_closure_is_a_fatal_handler() {
        let mut calls = 0;
        let mut handler = |_: &CanonicalError, raw: &[u8]| {
            calls += 1;
            FlushOutcome::Suppress(raw.to_vec())
        };
        let error = CanonicalError::new(
            ErrorKind::Fatal,
            Severity::ERROR,
            "x",
            crate::error::Location::new("y", 1),
        );
        assert_eq!(
            FatalHandler::handle(&mut handler, &error, b"raw"),
            FlushOutcome::Suppress(b"raw".to_vec())
        );
        assert_eq!(calls, 1);
    }
}
