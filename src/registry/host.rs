//! What the registry needs from the runtime it is embedded in.

use crate::error::{Location, Severity};

/// Capabilities of the host runtime.
pub trait HostRuntime {
    /// Whether the host routes its output through an interposition stage.
    fn supports_output_interposition(&self) -> bool;

    /// Asks the host to append `suffix` to every diagnostic it renders itself.
    fn append_diagnostic_suffix(&mut self, suffix: &str);
}

/// Host for Rust code running in the same process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InProcessHost {
    suffix: Option<String>,
}

impl InProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostic_suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Renders a diagnostic the way the host prints it, suffix included.
    pub fn format_diagnostic(&self, severity: Severity, message: &str, location: &Location) -> String {
        let line = format!(
            "{}: {} in {} on line {}",
            severity.label(),
            message,
            location.file,
            location.line
        );
        match &self.suffix {
            Some(suffix) => format!("{} {}", line, suffix),
            None => line,
        }
    }
}

impl HostRuntime for InProcessHost {
    fn supports_output_interposition(&self) -> bool {
        true
    }

    fn append_diagnostic_suffix(&mut self, suffix: &str) {
        self.suffix = Some(suffix.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_diagnostic_with_suffix() {
        let mut host = InProcessHost::new();
        let location = Location::new("bar.php", 123);
        assert_eq!(
            host.format_diagnostic(Severity::ERROR, "Foo", &location),
            "Fatal error: Foo in bar.php on line 123"
        );

        host.append_diagnostic_suffix("[abc]");
        assert_eq!(host.diagnostic_suffix(), Some("[abc]"));
        assert_eq!(
            host.format_diagnostic(Severity::PARSE, "Foo", &location),
            "Parse error: Foo in bar.php on line 123 [abc]"
        );
    }
}
