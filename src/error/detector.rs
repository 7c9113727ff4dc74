//! Fatal diagnostic detector for interposed output.
//!
//! A runtime that dies on a fatal error often has no hook for it and just
//! prints the diagnostic into the response. This module recognises that text.
//! Detection is two-staged: a cheap case-insensitive token probe that runs on
//! every chunk, and a structured regex that only runs when the probe hits.
//! The regex requires the session marker, so page content that merely talks
//! about a "fatal error" is never mistaken for a real one.

use regex::Regex;

use super::classification::{Frame, Severity};

/// Tokens that must appear somewhere in a chunk before the regex is tried.
const PROBE_TOKENS: [&[u8]; 2] = [b"fatal error", b"parse error"];

/// Fields pulled out of a matched fatal diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalCapture {
    /// `PARSE` for parse errors, `ERROR` for runtime fatals.
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    /// Frames from the optional call-stack block.
    pub trace: Vec<Frame>,
}

/// Structured matcher for one session's marker-guarded diagnostics.
#[derive(Debug, Clone)]
pub struct FatalPattern {
    /// The diagnostic regex, bound to a single marker and anchored at both ends.
    regex: Regex,
    /// Start of any `fatal error:` / `parse error:` token.
    token: Regex,
    /// Parser for `#n file(line): function` stack lines.
    frame: Regex,
    marker: String,
    /// The literal `[marker]` suffix.
    tag: String,
}

impl FatalPattern {
    /// Builds the matcher for diagnostics suffixed with `[marker]`.
    ///
    /// # Errors
    /// Returns an error if the resulting pattern exceeds the regex size limits.
    pub fn for_marker(marker: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"(?is)\A(parse|fatal) error:(.+?) in (.+?) on line (\d+)((?:\s*stack trace:)?(?:\s*#\d+[^\n]*)*)\s*\[{}\]\z",
            regex::escape(marker)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
            token: Regex::new(r"(?i)(?:parse|fatal) error:")?,
            frame: Regex::new(r"^#\d+\s+(?:(.+?)\((\d+)\):\s*)?(.*)$")?,
            marker: marker.to_string(),
            tag: format!("[{}]", marker),
        })
    }

    /// The marker this pattern is bound to.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Cheap pre-check: does the chunk mention a fatal or parse error at all?
    pub fn probe(chunk: &[u8]) -> bool {
        PROBE_TOKENS.iter().any(|token| {
            chunk
                .windows(token.len())
                .any(|window| window.eq_ignore_ascii_case(token))
        })
    }

    /// Finds the first marked diagnostic in the chunk.
    ///
    /// Each occurrence of the marker is paired with the nearest error token
    /// before it, so page text preceding the diagnostic never leaks into
    /// its fields. Tokens further back are only tried when the nearest one
    /// does not parse.
    pub fn detect(&self, text: &str) -> Option<FatalCapture> {
        let mut floor = 0;
        for (tag_at, _) in text.match_indices(self.tag.as_str()) {
            let end = tag_at + self.tag.len();
            let starts: Vec<usize> = self
                .token
                .find_iter(&text[floor..tag_at])
                .map(|m| floor + m.start())
                .collect();
            let found = starts
                .iter()
                .rev()
                .find_map(|&start| self.extract(&text[start..end]));
            if found.is_some() {
                return found;
            }
            floor = end;
        }
        None
    }

    /// Applies the anchored pattern to one candidate diagnostic.
    fn extract(&self, candidate: &str) -> Option<FatalCapture> {
        let caps = self.regex.captures(candidate)?;

        let severity = if caps[1].eq_ignore_ascii_case("parse") {
            Severity::PARSE
        } else {
            Severity::ERROR
        };
        let line = caps[4].parse().ok()?;
        let trace = caps
            .get(5)
            .map(|block| self.parse_stack(block.as_str()))
            .unwrap_or_default();

        Some(FatalCapture {
            severity,
            message: caps[2].trim().to_string(),
            file: caps[3].trim().to_string(),
            line,
            trace,
        })
    }

    fn parse_stack(&self, block: &str) -> Vec<Frame> {
        block
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('#'))
            .filter_map(|line| {
                let caps = self.frame.captures(line)?;
                let function = caps.get(3).map(|m| m.as_str().trim().to_string());
                Some(Frame {
                    function: function.filter(|f| !f.is_empty()),
                    file: caps.get(1).map(|m| m.as_str().to_string()),
                    line: caps.get(2).and_then(|m| m.as_str().parse().ok()),
                })
            })
            .collect()
    }
}
