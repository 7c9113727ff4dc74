//! End-user pages: the debug page shown in debug mode and the built-in fallback.

use std::fmt::Write as _;
use std::ops::Range;

use crate::error::CanonicalError;

/// Title of the built-in production page.
pub const FALLBACK_TITLE: &str = "Internal Server Error";

/// Maximum number of source lines shown around a fault.
pub const SOURCE_WINDOW: usize = 15;

/// Produces the rich diagnostic page shown in debug mode.
pub trait Renderer {
    fn debug_page(&self, error: &CanonicalError) -> String;
}

/// Plain HTML debug page reading source context from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlRenderer;

impl HtmlRenderer {
    fn source_excerpt(&self, error: &CanonicalError) -> Option<String> {
        let source = std::fs::read_to_string(error.file()).ok()?;
        let lines: Vec<&str> = source.lines().collect();
        let fault = error.line() as usize;
        let window = source_window(lines.len(), fault);
        if window.is_empty() {
            return None;
        }

        let mut out = String::new();
        for index in window {
            let number = index + 1;
            let text = escape_html(lines[index]);
            if number == fault {
                let _ = writeln!(out, "<span class=\"fault\">{:>5} | {}</span>", number, text);
            } else {
                let _ = writeln!(out, "{:>5} | {}", number, text);
            }
        }
        Some(out)
    }
}

impl Renderer for HtmlRenderer {
    fn debug_page(&self, error: &CanonicalError) -> String {
        let title = escape_html(error.title());
        let mut page = String::new();
        let _ = write!(
            page,
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
             <style>body{{font-family:sans-serif}}pre{{background:#f4f4f4;padding:8px}}\
             .fault{{background:#fdd;font-weight:bold}}</style>\n</head>\n<body>\n<h1>{title}</h1>\n",
            title = title
        );
        let _ = writeln!(page, "<p class=\"message\">{}</p>", escape_html(error.message()));
        let _ = writeln!(
            page,
            "<p class=\"location\">{} on line {}</p>",
            escape_html(error.file()),
            error.line()
        );

        if let Some(excerpt) = self.source_excerpt(error) {
            let _ = writeln!(page, "<pre class=\"source\">\n{}</pre>", excerpt);
        }

        if !error.is_captured() && !error.trace().is_empty() {
            let _ = writeln!(
                page,
                "<h2>Trace</h2>\n<pre class=\"trace\">{}</pre>",
                escape_html(&error.trace_as_string())
            );
        }

        page.push_str("</body>\n</html>\n");
        page
    }
}

/// Indices (0-based) of the source lines shown for a 1-based fault line.
///
/// The window is centred on the fault when possible and shifted to stay
/// within the file otherwise. An unknown or out-of-range line gives an
/// empty window.
pub fn source_window(total: usize, fault_line: usize) -> Range<usize> {
    if fault_line == 0 || fault_line > total {
        return 0..0;
    }
    let start = (fault_line - 1).saturating_sub(SOURCE_WINDOW / 2);
    let end = (start + SOURCE_WINDOW).min(total);
    end.saturating_sub(SOURCE_WINDOW)..end
}

/// Minimal page used when no message file is configured or readable.
pub fn fallback_page() -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{t}</title>\n</head>\n\
         <body>\n<h1>{t}</h1>\n<p>The server encountered an internal error and was unable to \
         complete your request.</p>\n</body>\n</html>\n",
        t = FALLBACK_TITLE
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Frame, Location, Severity};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source_file(lines: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for i in 1..=lines {
            writeln!(file, "line {}", i).unwrap();
        }
        file
    }

    fn error_at(file: &str, line: u32) -> CanonicalError {
        CanonicalError::new(
            ErrorKind::Recoverable,
            Severity::WARNING,
            "Undefined <index>",
            Location::new(file, line),
        )
        .with_trace(vec![Frame {
            function: Some("render()".to_string()),
            file: Some("/srv/view.php".to_string()),
            line: Some(12),
        }])
    }

    #[test]
    fn test_source_window_bounds() {
        assert_eq!(source_window(100, 50), 42..57);
        assert_eq!(source_window(100, 1), 0..15);
        assert_eq!(source_window(100, 100), 85..100);
        assert_eq!(source_window(5, 3), 0..5);
        assert_eq!(source_window(100, 0), 0..0);
        assert_eq!(source_window(10, 11), 0..0);
        for total in 0..40 {
            for fault in 1..=total {
                let window = source_window(total, fault);
                assert!(window.len() <= SOURCE_WINDOW);
                assert!(window.contains(&(fault - 1)));
            }
        }
    }

    #[test]
    fn test_debug_page_contents() {
        let file = source_file(40);
        let path = file.path().to_str().unwrap().to_string();
        let page = HtmlRenderer.debug_page(&error_at(&path, 20));

        assert!(page.contains("<title>Warning</title>"));
        assert!(page.contains("Undefined &lt;index&gt;"));
        assert!(page.contains("<span class=\"fault\">   20 | line 20</span>"));
        assert!(page.contains("   13 | line 13"));
        assert!(page.contains("   27 | line 27"));
        assert!(!page.contains("line 12\n"));
        assert!(!page.contains("line 28\n"));
        assert!(page.contains("#0 /srv/view.php(12): render()"));
    }

    #[test]
    fn test_captured_error_has_no_trace_section() {
        let error = error_at("/nonexistent.php", 3).with_captured_text("raw chunk");
        let page = HtmlRenderer.debug_page(&error);
        assert!(!page.contains("Trace"));
        assert!(!page.contains("class=\"source\""));
    }

    #[test]
    fn test_fallback_page_title() {
        let page = fallback_page();
        assert!(page.contains("<title>Internal Server Error</title>"));
        assert!(page.contains("<h1>Internal Server Error</h1>"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
