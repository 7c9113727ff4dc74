//! Contracts for the collaborators the pipeline reports through, plus the
//! small defaults the crate ships with.

use std::env::{self, VarError};
use std::io::{self, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use thiserror::Error;

/// Sink for the single-line operator log record.
pub trait Logger {
    fn write(&self, record: &str);
}

/// Operator notification transport. Failures are reported to the caller,
/// which swallows them.
pub trait Notifier {
    fn send(&self, targets: &[String], subject: &str, body: &str) -> io::Result<()>;
}

/// Reads the static fallback message shown to end users in production.
pub trait MessageFileProvider {
    fn read(&self, path: &Path) -> Option<Vec<u8>>;
}

/// Errors from the best-effort request context getters.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The value is not available in this environment.
    #[error("{0} is not set")]
    Missing(&'static str),

    /// The value exists but is not valid unicode.
    #[error("{0} is not valid unicode")]
    NotUnicode(&'static str),
}

/// Where the request that triggered a fault came from.
pub trait ContextSource {
    fn request_uri(&self) -> Result<String, ContextError>;
    fn client_host(&self) -> Result<String, ContextError>;
    fn user_agent(&self) -> Result<String, ContextError>;
}

/// Request context attached to operator notifications. A field that could
/// not be gathered is `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Asks each getter in turn. A failing getter only drops its own field.
    pub fn gather(source: &dyn ContextSource) -> Self {
        Self {
            uri: best_effort("uri", source.request_uri()),
            host: best_effort("host", source.client_host()),
            user_agent: best_effort("user_agent", source.user_agent()),
        }
    }

    /// `Name: value` lines for the fields that were gathered.
    pub fn lines(&self) -> Vec<String> {
        [
            ("URI", &self.uri),
            ("Host", &self.host),
            ("User-Agent", &self.user_agent),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}: {}", name, v)))
        .collect()
    }
}

fn best_effort(field: &str, value: Result<String, ContextError>) -> Option<String> {
    match value {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(field, error = %e, "request context field unavailable");
            None
        }
    }
}

/// Writes log records as `error` events under the `faultwatch::report` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn write(&self, record: &str) {
        tracing::error!(target: "faultwatch::report", "{}", record);
    }
}

/// Notifier that only logs what it would have sent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, targets: &[String], subject: &str, body: &str) -> io::Result<()> {
        tracing::warn!(
            target: "faultwatch::notify",
            to = %targets.join(", "),
            subject,
            lines = body.lines().count(),
            "operator notification"
        );
        Ok(())
    }
}

/// Program used by [`SendmailNotifier::default`].
pub const DEFAULT_SENDMAIL: &str = "sendmail";

/// Hands the message to a local `sendmail -t` and does not wait for delivery.
/// The child is reaped on a background thread.
#[derive(Clone, Debug)]
pub struct SendmailNotifier {
    program: String,
}

impl Default for SendmailNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_SENDMAIL)
    }
}

impl SendmailNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, targets: &[String], subject: &str, body: &str) -> io::Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        // stdin is dropped before the reaper waits, so sendmail sees EOF.
        let written = match child.stdin.take() {
            Some(mut stdin) => write!(
                stdin,
                "To: {}\nSubject: {}\n\n{}\n",
                targets.join(", "),
                subject,
                body
            ),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sendmail stdin unavailable",
            )),
        };
        reap_in_background(child, self.program.clone());
        written
    }
}

fn reap_in_background(mut child: Child, program: String) {
    thread::spawn(move || match child.wait() {
        Ok(status) if !status.success() => {
            tracing::warn!(%program, %status, "notification program failed");
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(%program, error = %e, "failed to reap notification program"),
    });
}

/// Reads message files from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsMessageFile;

impl MessageFileProvider for FsMessageFile {
    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "message file unreadable");
                None
            }
        }
    }
}

/// Reads request context from CGI-style environment variables.
#[derive(Clone, Copy, Debug, Default)]
pub struct CgiEnvironment;

impl CgiEnvironment {
    fn var(name: &'static str) -> Result<String, ContextError> {
        env::var(name).map_err(|e| match e {
            VarError::NotPresent => ContextError::Missing(name),
            VarError::NotUnicode(_) => ContextError::NotUnicode(name),
        })
    }
}

impl ContextSource for CgiEnvironment {
    fn request_uri(&self) -> Result<String, ContextError> {
        Self::var("REQUEST_URI")
    }

    fn client_host(&self) -> Result<String, ContextError> {
        Self::var("REMOTE_HOST").or_else(|_| Self::var("REMOTE_ADDR"))
    }

    fn user_agent(&self) -> Result<String, ContextError> {
        Self::var("HTTP_USER_AGENT")
    }
}

/// Context source for hosts that do not serve requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoContext;

impl ContextSource for NoContext {
    fn request_uri(&self) -> Result<String, ContextError> {
        Err(ContextError::Missing("request uri"))
    }

    fn client_host(&self) -> Result<String, ContextError> {
        Err(ContextError::Missing("client host"))
    }

    fn user_agent(&self) -> Result<String, ContextError> {
        Err(ContextError::Missing("user agent"))
    }
}
