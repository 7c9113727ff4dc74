//! Fault detection and normalization.
//!
//! This module turns the different ways a hosted runtime reports trouble
//! into a single [`CanonicalError`]: recoverable diagnostics are filtered by
//! the [`ErrorClassifier`], fatal diagnostics printed into the output are
//! recognised by the [`FatalPattern`] detector, and panics are captured by
//! the [`panic`] hook.

pub mod classification;
pub mod detector;
pub mod normalizer;
pub mod panic;

// Re-export main types for convenient access
pub use classification::{
    CanonicalError, Classification, ErrorClassifier, ErrorKind, Frame, Location, RawSignal,
    Severity,
};
pub use detector::{FatalCapture, FatalPattern};
pub use normalizer::ExceptionNormalizer;
