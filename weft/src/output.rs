//! Verbosity-gated user output.
//!
//! Stdout is reserved for program output (tool results, workflow outputs).
//! Human-oriented progress, connection messages, and mirrored subprocess
//! stderr go here, to stderr, gated by the verbosity level. Real errors are
//! always shown regardless of level.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// How chatty the stderr channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Only real errors.
    Quiet,
    /// Progress and connection messages.
    #[default]
    Normal,
    /// Everything, including all subprocess stderr.
    Verbose,
}

/// Cloneable writer shared by the transports, engine, and CLI.
///
/// Interleaved writes from the dispatcher and stderr tasks are serialized by
/// an internal lock, so concurrent messages never shear mid-line.
#[derive(Clone)]
pub struct OutputWriter {
    verbosity: Verbosity,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for OutputWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputWriter")
            .field("verbosity", &self.verbosity)
            .finish_non_exhaustive()
    }
}

impl OutputWriter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            sink: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
        }
    }

    /// Test constructor writing into the given sink.
    pub fn with_sink(verbosity: Verbosity, sink: Box<dyn Write + Send>) -> Self {
        Self {
            verbosity,
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Progress/connection message; suppressed in quiet mode.
    pub fn progress(&self, line: &str) {
        if self.verbosity >= Verbosity::Normal {
            self.write_line(line);
        }
    }

    /// Detail message; shown only in verbose mode.
    pub fn detail(&self, line: &str) {
        if self.verbosity >= Verbosity::Verbose {
            self.write_line(line);
        }
    }

    /// Real error; always shown.
    pub fn error(&self, line: &str) {
        self.write_line(line);
    }

    /// Mirror one subprocess stderr line: in verbose mode every line, in
    /// quieter modes only classified real errors.
    pub fn mirror_stderr(&self, server: &str, line: &str, is_real_error: bool) {
        if self.verbosity >= Verbosity::Verbose {
            self.write_line(&format!("[{server}] {line}"));
        } else if is_real_error {
            self.write_line(&format!("[{server}] {line}"));
        }
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{line}");
        }
    }
}

impl Default for OutputWriter {
    fn default() -> Self {
        Self::new(Verbosity::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(verbosity: Verbosity) -> (OutputWriter, SharedBuf) {
        let buf = SharedBuf::default();
        let writer = OutputWriter::with_sink(verbosity, Box::new(buf.clone()));
        (writer, buf)
    }

    fn contents(buf: &SharedBuf) -> String {
        String::from_utf8(buf.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn quiet_mode_passes_only_errors() {
        let (writer, buf) = capture(Verbosity::Quiet);
        writer.progress("connecting");
        writer.detail("payload");
        writer.error("boom");
        assert_eq!(contents(&buf), "boom\n");
    }

    #[test]
    fn quiet_mode_mirrors_only_real_stderr() {
        let (writer, buf) = capture(Verbosity::Quiet);
        writer.mirror_stderr("fs", "info: loading configuration", false);
        writer.mirror_stderr("fs", "error: connection refused", true);
        assert_eq!(contents(&buf), "[fs] error: connection refused\n");
    }

    #[test]
    fn verbose_mode_mirrors_everything() {
        let (writer, buf) = capture(Verbosity::Verbose);
        writer.mirror_stderr("fs", "debug: sending", false);
        writer.mirror_stderr("fs", "error: x", true);
        let text = contents(&buf);
        assert!(text.contains("debug: sending"));
        assert!(text.contains("error: x"));
    }
}
