//! Subprocess stderr classification.
//!
//! Every stderr line is buffered verbatim for post-mortem diagnostics and
//! classified by [`is_real_error`]. Upstream MCP servers routinely log Python
//! tracebacks that the agentic loop recovers from on the next turn, so those
//! are normal logging here, not errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Normal-logging prefixes: the line as a whole is a log statement.
const BENIGN_PREFIXES: &[&str] = &["debug:", "info:", "trace:"];

/// Normal-logging markers anywhere in the line, including expected
/// interpreter tracebacks from agentic-loop iterations.
const BENIGN_MARKERS: &[&str] = &[
    "loading configuration",
    "sending:",
    "received:",
    "api call succeeded",
    "command timeout:",
    "traceback (most recent call last)",
    "nameerror:",
    "keyerror:",
    "typeerror:",
    "valueerror:",
    "attributeerror:",
    "code execution failed",
    "invalid file paths detected",
];

/// Keywords that mark a line as a real error.
const ERROR_MARKERS: &[&str] = &[
    "error:",
    "failed:",
    "panic:",
    "fatal:",
    "authentication failed",
    "connection refused",
    "timed out",
    "timeout exceeded",
    "permission denied",
];

/// Classifies one stderr line. Benign patterns win over error keywords, so
/// `"info: loading configuration"` stays quiet even though a later clause of
/// the same server's logging might contain `error:`.
pub fn is_real_error(line: &str) -> bool {
    let lower = line.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    if BENIGN_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return false;
    }
    if BENIGN_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Verbatim stderr buffer plus the sticky real-error flag.
#[derive(Default, Debug)]
pub struct StderrLog {
    lines: Mutex<Vec<String>>,
    has_real_errors: AtomicBool,
}

impl StderrLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one line and returns its classification.
    pub fn record(&self, line: &str) -> bool {
        let real = is_real_error(line);
        if real {
            self.has_real_errors.store(true, Ordering::SeqCst);
        }
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
        real
    }

    pub fn has_real_errors(&self) -> bool {
        self.has_real_errors.load(Ordering::SeqCst)
    }

    /// All buffered lines, verbatim.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Only the lines classified as real errors, for the post-mortem summary.
    pub fn real_error_lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|l| {
                l.iter()
                    .filter(|line| is_real_error(line))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_lines_are_not_errors() {
        let benign = [
            "debug: opening channel",
            "DEBUG: sending: {\"jsonrpc\":\"2.0\"}",
            "info: loading configuration",
            "Info: received: tools/list",
            "api call succeeded in 120ms",
            "command timeout: 30s",
            "Traceback (most recent call last):",
            "NameError: name 'foo' is not defined",
            "KeyError: 'path'",
            "TypeError: unsupported operand",
            "ValueError: invalid literal",
            "AttributeError: 'NoneType' object",
            "code execution failed, retrying with model feedback",
            "invalid file paths detected in arguments",
            "",
        ];
        for line in benign {
            assert!(!is_real_error(line), "expected benign: {line:?}");
        }
    }

    #[test]
    fn error_lines_are_real() {
        let errors = [
            "error: connection refused",
            "startup failed: missing binary",
            "panic: index out of range",
            "fatal: cannot allocate",
            "authentication failed for token",
            "connection refused by upstream",
            "request timed out after 30s",
            "timeout exceeded waiting for response",
            "permission denied: /etc/shadow",
        ];
        for line in errors {
            assert!(is_real_error(line), "expected real error: {line:?}");
        }
    }

    #[test]
    fn benign_prefix_wins_over_error_keyword() {
        assert!(!is_real_error("debug: last call failed: retrying"));
        assert!(!is_real_error("info: previous attempt timed out, will retry"));
    }

    #[test]
    fn log_tracks_flag_and_filters() {
        let log = StderrLog::new();
        assert!(!log.record("info: loading configuration"));
        assert!(!log.has_real_errors());
        assert!(log.record("error: connection refused"));
        assert!(log.has_real_errors());
        assert_eq!(log.lines().len(), 2);
        assert_eq!(log.real_error_lines(), vec!["error: connection refused"]);
    }
}
