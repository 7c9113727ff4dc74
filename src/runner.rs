//! Child-process host.
//!
//! Runs a program under a [`HandlerRegistry`]: its stdout is the response
//! and goes through the output-interposition stage, its non-fatal stderr
//! diagnostics become recoverable signals, and a fatal stderr diagnostic or
//! an abnormal exit is an uncaught fault.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use regex::Regex;
use thiserror::Error;

use crate::error::{CanonicalError, ExceptionNormalizer, RawSignal, Severity};
use crate::pipeline::ResponseWriter;
use crate::registry::{HandlerRegistry, HostRuntime, RegistryError};
use crate::scanner::OutputInterposer;

/// Environment variable carrying the bare session marker.
pub const MARKER_ENV: &str = "FAULTWATCH_MARKER";

/// Environment variable carrying the suffix the child appends to its diagnostics.
pub const SUFFIX_ENV: &str = "FAULTWATCH_DIAGNOSTIC_SUFFIX";

const READ_CHUNK: usize = 8192;

/// Errors that can occur while running a child program.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The program could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Relaying the child's output failed.
    #[error("i/o error while relaying child output: {0}")]
    Io(#[from] io::Error),

    /// The registry could not be configured.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Host runtime for a spawned program. The diagnostic suffix is handed to
/// the child through its environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildHost {
    suffix: Option<String>,
}

impl ChildHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables to set on the child; empty until fatal capture is enabled.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        match &self.suffix {
            Some(suffix) => {
                let marker = suffix.trim_start_matches('[').trim_end_matches(']');
                vec![(MARKER_ENV, marker.to_string()), (SUFFIX_ENV, suffix.clone())]
            }
            None => Vec::new(),
        }
    }
}

impl HostRuntime for ChildHost {
    fn supports_output_interposition(&self) -> bool {
        true
    }

    fn append_diagnostic_suffix(&mut self, suffix: &str) {
        self.suffix = Some(suffix.to_string());
    }
}

/// Parses `<Label>: <message> in <file> on line <n>` diagnostics. A leading
/// `@` marks the diagnostic as silenced by its call site.
#[derive(Clone, Debug)]
pub struct DiagnosticLineParser {
    regex: Regex,
}

impl DiagnosticLineParser {
    pub fn new() -> Result<Self, regex::Error> {
        let regex = Regex::new(
            r"^(?P<silenced>@)?(?P<label>[A-Za-z][A-Za-z ]*?):\s*(?P<message>.+?) in (?P<file>.+?) on line (?P<line>\d+)(?:\s*\[[^\]]*\])?\s*$",
        )?;
        Ok(Self { regex })
    }

    pub fn parse(&self, line: &str) -> Option<RawSignal> {
        let caps = self.regex.captures(line.trim_end())?;
        let kind = Severity::from_label(&caps["label"])?;
        let line_no = caps["line"].parse().ok()?;

        let signal = RawSignal::new(kind, caps["message"].trim(), caps["file"].trim(), line_no);
        Some(if caps.name("silenced").is_some() {
            signal.silenced()
        } else {
            signal
        })
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the child; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunResult {
    /// Exit code to report for the run.
    pub exit_code: i32,
    /// Status set on the response, if any.
    pub status: Option<u16>,
    /// Fatal diagnostics captured from the child's stdout and stderr.
    pub captured_fatals: usize,
    /// Recoverable errors raised by the child's diagnostics.
    pub raised: Vec<CanonicalError>,
    /// The child exited unsuccessfully without a captured fatal.
    pub abnormal_exit: bool,
}

/// Diagnostics collected from the child's stderr.
#[derive(Debug, Default)]
struct StderrDiagnostics {
    raised: Vec<CanonicalError>,
    fatals: Vec<CanonicalError>,
}

/// Runs one program under a registry.
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Spawns the program and relays its output to `out` until it exits.
    pub fn run<W: Write>(
        &self,
        registry: &mut HandlerRegistry<ChildHost>,
        out: &mut W,
    ) -> Result<RunResult, RunnerError> {
        let parser = DiagnosticLineParser::new().map_err(RegistryError::from)?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(registry.host().env())
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        tracing::info!(program = %self.config.program, pid = child.id(), "child started");

        let (mut stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(RunnerError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "child pipes unavailable",
                )))
            }
        };

        let (tx, rx) = mpsc::channel();
        let relay = thread::spawn(move || -> io::Result<()> {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf)? == 0 {
                    return Ok(());
                }
                let line = String::from_utf8_lossy(&buf);
                match parser.parse(&line) {
                    Some(signal) => {
                        if tx.send(signal).is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        let _ = io::stderr().lock().write_all(&buf);
                    }
                }
            }
        });

        let mut diagnostics = StderrDiagnostics::default();
        let mut response = ResponseWriter::new(&mut *out);
        {
            let mut interposer = OutputInterposer::new(&mut response, &mut *registry);
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let read = stdout.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                interposer.write_all(&chunk[..read])?;
                drain_signals(&**interposer.stage(), &rx, &mut diagnostics, false);
            }
            interposer.finish()?;
        }

        let status = child.wait()?;
        match relay.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(RunnerError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "stderr relay thread panicked",
                )))
            }
        }
        drain_signals(registry, &rx, &mut diagnostics, true);

        let captured_fatals = registry.captured_fatals() + diagnostics.fatals.len();
        let signal = termination_signal(&status);
        let abnormal_exit = !status.success() && captured_fatals == 0;

        // Output capture already rendered its page; otherwise the first
        // stderr fatal names the cause, and a bare abnormal exit comes last.
        let uncaught = if registry.captured_fatals() > 0 {
            None
        } else if let Some(fatal) = diagnostics.fatals.first() {
            Some(fatal.clone())
        } else if abnormal_exit {
            let error = ExceptionNormalizer::from_exit(&self.config.program, status.code(), signal);
            tracing::warn!(%error, "child terminated abnormally");
            Some(error)
        } else {
            None
        };
        if let Some(error) = uncaught {
            if !registry.handle_uncaught(error, &mut response) {
                tracing::error!("exception handling disabled, child fault not reported to the client");
            }
        }

        let exit_code = match (status.code(), signal) {
            (Some(0), _) if captured_fatals > 0 => 1,
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        };
        tracing::info!(exit_code, captured_fatals, "child finished");

        Ok(RunResult {
            exit_code,
            status: response.status(),
            captured_fatals,
            raised: diagnostics.raised,
            abnormal_exit,
        })
    }
}

/// Sorts queued stderr diagnostics: fatal levels are kept as fatal errors,
/// the rest go to the registry's recoverable channel. With `wait` set,
/// blocks until the relay thread has hung up.
fn drain_signals<H: HostRuntime>(
    registry: &HandlerRegistry<H>,
    rx: &Receiver<RawSignal>,
    diagnostics: &mut StderrDiagnostics,
    wait: bool,
) {
    let mut deliver = |signal: RawSignal| {
        if signal.kind.is_fatal() {
            let error = ExceptionNormalizer::from_fatal_signal(&signal);
            tracing::warn!(%error, "fatal diagnostic on child stderr");
            diagnostics.fatals.push(error);
        } else if let Err(error) = registry.on_signal(signal) {
            tracing::warn!(%error, "recoverable error raised by child");
            diagnostics.raised.push(error);
        }
    };
    if wait {
        rx.iter().for_each(&mut deliver);
    } else {
        rx.try_iter().for_each(&mut deliver);
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
