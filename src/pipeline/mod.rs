//! Central fault handling: log, notify, render.
//!
//! Every canonical error that is not raised back to the caller ends up in
//! [`ExceptionPipeline::handle`]. The operator channel always runs; the end
//! user gets either the debug page, the configured message file, or the
//! built-in fallback page, never raw diagnostic text in production.

mod collaborators;
mod renderer;
mod response;

pub use collaborators::{
    CgiEnvironment, ContextError, ContextSource, FsMessageFile, LogNotifier, Logger,
    MessageFileProvider, NoContext, Notifier, RequestContext, SendmailNotifier, TracingLogger,
    DEFAULT_SENDMAIL,
};
pub use renderer::{
    escape_html, fallback_page, source_window, HtmlRenderer, Renderer, FALLBACK_TITLE,
    SOURCE_WINDOW,
};
pub use response::{ResponseSink, ResponseWriter, ERROR_STATUS};

use crate::error::CanonicalError;
use crate::registry::HandlerState;

/// How the rendered body leaves the pipeline.
pub enum Delivery<'a> {
    /// Hand the body back to the caller. Used by the output scanner, which
    /// substitutes it for the flushed chunk.
    Return,
    /// Set the error status if still possible and write the body.
    Emit(&'a mut dyn ResponseSink),
}

/// The handling pipeline and its collaborators.
pub struct ExceptionPipeline {
    logger: Box<dyn Logger>,
    notifier: Box<dyn Notifier>,
    renderer: Box<dyn Renderer>,
    message_files: Box<dyn MessageFileProvider>,
    context: Box<dyn ContextSource>,
}

impl Default for ExceptionPipeline {
    fn default() -> Self {
        Self {
            logger: Box::new(TracingLogger),
            notifier: Box::new(LogNotifier),
            renderer: Box::new(HtmlRenderer),
            message_files: Box::new(FsMessageFile),
            context: Box::new(CgiEnvironment),
        }
    }
}

impl std::fmt::Debug for ExceptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionPipeline").finish_non_exhaustive()
    }
}

impl ExceptionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Box::new(logger);
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.set_notifier(notifier);
        self
    }

    /// Swaps the notification transport in place.
    pub fn set_notifier(&mut self, notifier: impl Notifier + 'static) {
        self.notifier = Box::new(notifier);
    }

    pub fn with_renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_message_files(mut self, provider: impl MessageFileProvider + 'static) -> Self {
        self.message_files = Box::new(provider);
        self
    }

    pub fn with_context(mut self, source: impl ContextSource + 'static) -> Self {
        self.context = Box::new(source);
        self
    }

    /// Handles one error. Returns the rendered body in [`Delivery::Return`]
    /// mode and `None` once it has been emitted.
    pub fn handle(
        &self,
        state: &HandlerState,
        error: CanonicalError,
        delivery: Delivery<'_>,
    ) -> Option<String> {
        self.report(state, &error);
        let body = self.render(state, &error);

        match delivery {
            Delivery::Return => Some(body),
            Delivery::Emit(sink) => {
                if !sink.is_committed() {
                    sink.set_status(ERROR_STATUS);
                }
                if let Err(e) = sink.emit(body.as_bytes()) {
                    tracing::error!(error = %e, "failed to emit error page");
                }
                None
            }
        }
    }

    /// Operator channel: log record, then notification when configured.
    pub fn report(&self, state: &HandlerState, error: &CanonicalError) {
        self.logger.write(&log_record(error));

        if state.notify_targets().is_empty() || state.debug_mode() {
            return;
        }

        let context = RequestContext::gather(self.context.as_ref());
        let subject = format!("{}: {}", error.title(), error.message());
        let body = notification_body(error, &context);
        if let Err(e) = self.notifier.send(state.notify_targets(), &subject, &body) {
            tracing::warn!(error = %e, "operator notification failed");
        }
    }

    /// End-user channel.
    pub fn render(&self, state: &HandlerState, error: &CanonicalError) -> String {
        if state.debug_mode() {
            return self.renderer.debug_page(error);
        }

        state
            .message_file()
            .and_then(|path| self.message_files.read(path))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(fallback_page)
    }
}

/// Single-line JSON record of an error.
fn log_record(error: &CanonicalError) -> String {
    serde_json::to_string(error).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "log record serialization failed");
        error.to_string()
    })
}

fn notification_body(error: &CanonicalError, context: &RequestContext) -> String {
    let mut lines = vec![
        error.message().to_string(),
        String::new(),
        format!("Location: {}", error.location()),
    ];
    if !error.trace().is_empty() {
        lines.push(String::new());
        lines.push(error.trace_as_string());
    }
    lines.push(String::new());
    lines.extend(context.lines());
    lines.push(format!("Time: {}", chrono::Utc::now().to_rfc3339()));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Location, Severity};
    use std::cell::RefCell;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    type Sent = Rc<RefCell<Vec<(Vec<String>, String, String)>>>;

    #[derive(Clone, Default)]
    struct RecordingLogger(Rc<RefCell<Vec<String>>>);

    impl Logger for RecordingLogger {
        fn write(&self, record: &str) {
            self.0.borrow_mut().push(record.to_string());
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Sent,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, targets: &[String], subject: &str, body: &str) -> io::Result<()> {
            self.sent
                .borrow_mut()
                .push((targets.to_vec(), subject.to_string(), body.to_string()));
            if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, "smtp down"))
            } else {
                Ok(())
            }
        }
    }

    struct StaticMessage(&'static str);

    impl MessageFileProvider for StaticMessage {
        fn read(&self, _path: &Path) -> Option<Vec<u8>> {
            Some(self.0.as_bytes().to_vec())
        }
    }

    struct FixedContext;

    impl ContextSource for FixedContext {
        fn request_uri(&self) -> Result<String, ContextError> {
            Ok("/cart".to_string())
        }

        fn client_host(&self) -> Result<String, ContextError> {
            Err(ContextError::Missing("REMOTE_HOST"))
        }

        fn user_agent(&self) -> Result<String, ContextError> {
            Ok("Mozilla/5.0".to_string())
        }
    }

    fn fatal() -> CanonicalError {
        CanonicalError::new(
            ErrorKind::Fatal,
            Severity::ERROR,
            "Allowed memory size exhausted",
            Location::new("bar.php", 123),
        )
    }

    fn pipeline(logger: &RecordingLogger, notifier: &RecordingNotifier) -> ExceptionPipeline {
        ExceptionPipeline::new()
            .with_logger(logger.clone())
            .with_notifier(notifier.clone())
            .with_message_files(FsMessageFile)
            .with_context(FixedContext)
    }

    fn state_with_targets() -> HandlerState {
        HandlerState {
            notify_targets: vec!["ops@example.com".to_string()],
            ..HandlerState::default()
        }
    }

    // ==================== Operator Channel Tests ====================

    #[test]
    fn test_log_record_is_single_line_json() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        pipeline(&logger, &notifier).handle(&HandlerState::default(), fatal(), Delivery::Return);

        let records = logger.0.borrow();
        assert_eq!(records.len(), 1);
        assert!(!records[0].contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(value["kind"], "fatal");
        assert_eq!(value["message"], "Allowed memory size exhausted");
        assert_eq!(value["file"], "bar.php");
        assert_eq!(value["line"], 123);
    }

    #[test]
    fn test_notification_sent_with_context() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        pipeline(&logger, &notifier).report(&state_with_targets(), &fatal());

        let sent = notifier.sent.borrow();
        assert_eq!(sent.len(), 1);
        let (targets, subject, body) = &sent[0];
        assert_eq!(targets, &vec!["ops@example.com".to_string()]);
        assert_eq!(subject, "Fatal error: Allowed memory size exhausted");
        assert!(body.contains("Location: bar.php:123"));
        assert!(body.contains("URI: /cart"));
        assert!(body.contains("User-Agent: Mozilla/5.0"));
        assert!(!body.contains("Host:"));
        assert!(body.contains("Time: "));
    }

    #[test]
    fn test_no_notification_without_targets_or_in_debug_mode() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        let pipeline = pipeline(&logger, &notifier);

        pipeline.report(&HandlerState::default(), &fatal());
        let mut debug = state_with_targets();
        debug.debug_mode = true;
        pipeline.report(&debug, &fatal());

        assert!(notifier.sent.borrow().is_empty());
        assert_eq!(logger.0.borrow().len(), 2);
    }

    #[test]
    fn test_notifier_failure_is_swallowed() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let body = pipeline(&logger, &notifier).handle(&state_with_targets(), fatal(), Delivery::Return);
        assert!(body.is_some());
        assert_eq!(notifier.sent.borrow().len(), 1);
    }

    // ==================== End-User Channel Tests ====================

    #[test]
    fn test_production_fallback_hides_message() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        let body = pipeline(&logger, &notifier)
            .handle(&HandlerState::default(), fatal(), Delivery::Return)
            .unwrap();
        assert!(body.contains(FALLBACK_TITLE));
        assert!(!body.contains("Allowed memory size"));
    }

    #[test]
    fn test_unreadable_message_file_falls_back() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        let state = HandlerState {
            message_file: Some(PathBuf::from("/nonexistent/oops.html")),
            ..HandlerState::default()
        };
        let body = pipeline(&logger, &notifier).render(&state, &fatal());
        assert!(body.contains(FALLBACK_TITLE));
    }

    #[test]
    fn test_message_file_is_used_when_readable() {
        let state = HandlerState {
            message_file: Some(PathBuf::from("maintenance.html")),
            ..HandlerState::default()
        };
        let pipeline = ExceptionPipeline::new().with_message_files(StaticMessage("down for a bit"));
        assert_eq!(pipeline.render(&state, &fatal()), "down for a bit");
    }

    #[test]
    fn test_debug_mode_renders_debug_page() {
        let state = HandlerState {
            debug_mode: true,
            ..HandlerState::default()
        };
        let body = ExceptionPipeline::new().render(&state, &fatal());
        assert!(body.contains("Allowed memory size exhausted"));
        assert!(!body.contains(FALLBACK_TITLE));
    }

    // ==================== Delivery Tests ====================

    #[test]
    fn test_return_mode_hands_body_back() {
        let logger = RecordingLogger::default();
        let notifier = RecordingNotifier::default();
        let body = pipeline(&logger, &notifier).handle(
            &HandlerState::default(),
            fatal(),
            Delivery::Return,
        );
        assert!(body.unwrap().contains(FALLBACK_TITLE));
        assert_eq!(logger.0.borrow().len(), 1);
    }

    #[test]
    fn test_emit_sets_status_when_uncommitted() {
        let mut response = ResponseWriter::new(Vec::new());
        let body = ExceptionPipeline::new().handle(
            &HandlerState::default(),
            fatal(),
            Delivery::Emit(&mut response),
        );
        assert!(body.is_none());
        assert_eq!(response.status(), Some(ERROR_STATUS));
        let out = String::from_utf8(response.into_inner()).unwrap();
        assert!(out.contains(FALLBACK_TITLE));
    }

    #[test]
    fn test_emit_leaves_status_when_committed() {
        let mut response = ResponseWriter::new(Vec::new());
        io::Write::write_all(&mut response, b"<p>half a page").unwrap();
        ExceptionPipeline::new().handle(
            &HandlerState::default(),
            fatal(),
            Delivery::Emit(&mut response),
        );
        assert_eq!(response.status(), None);
        let out = String::from_utf8(response.into_inner()).unwrap();
        assert!(out.starts_with("<p>half a page"));
        assert!(out.contains(FALLBACK_TITLE));
    }
}
