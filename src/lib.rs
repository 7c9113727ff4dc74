//! faultwatch - runtime fault interception and handling
//!
//! Recoverable diagnostics, fatal diagnostics printed into the output
//! stream, panics and abnormal child exits are normalized into one
//! [`error::CanonicalError`] and routed through a single
//! [`pipeline::ExceptionPipeline`] configured by a session-scoped
//! [`registry::HandlerRegistry`].

pub mod error;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod scanner;
pub mod settings;
