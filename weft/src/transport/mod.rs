//! Stdio transport for MCP tool-server subprocesses.
//!
//! Spawns the child with piped stdio and runs three tasks: a stdout read
//! loop (line-framed JSON-RPC with a 20 MB per-line cap), a stdin write loop
//! (single writer, newline-delimited), and a stderr scanner (verbatim buffer
//! plus [`stderr::is_real_error`] classification). Serialization of outbound
//! traffic happens in the write loop, so the transport is safe for
//! concurrent use; the response dispatcher demuxes the inbound side.

pub mod stderr;

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ErrorCode, WeftError};
use crate::jsonrpc::JsonRpcMessage;
use crate::output::OutputWriter;
use stderr::StderrLog;

/// Hard per-line cap. Large aggregated tool responses must fit in one line;
/// anything beyond this indicates an upstream fault.
pub const MAX_LINE_BYTES: usize = 20 * 1024 * 1024;

/// Inbound/outbound channel depth. If the consumer falls behind, reads block
/// the transport, which is acceptable because the subprocess is the source.
const CHANNEL_DEPTH: usize = 10;

/// Grace period between closing the child's stdin and force-killing it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// How to launch one tool-server subprocess.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Display name used in mirrored stderr and diagnostics.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// A running stdio transport.
#[derive(Debug)]
pub struct StdioTransport {
    name: String,
    write_tx: mpsc::Sender<JsonRpcMessage>,
    stderr_log: Arc<StderrLog>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    output: OutputWriter,
}

impl StdioTransport {
    /// Spawns the subprocess and starts the read/write/stderr tasks.
    ///
    /// Returns the transport handle and the inbound message stream. Fails
    /// with `SERVER_START_FAILED` when the child cannot be executed.
    pub fn spawn(
        config: TransportConfig,
        output: OutputWriter,
    ) -> Result<(Arc<Self>, mpsc::Receiver<JsonRpcMessage>), WeftError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            WeftError::new(
                ErrorCode::ServerStartFailed,
                format!("failed to start server {:?}: {e}", config.name),
            )
            .with_cause(e)
            .with_context("command", &config.command)
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            WeftError::new(ErrorCode::ServerStartFailed, "child stdin not piped")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            WeftError::new(ErrorCode::ServerStartFailed, "child stdout not piped")
        })?;
        let child_stderr = child.stderr.take().ok_or_else(|| {
            WeftError::new(ErrorCode::ServerStartFailed, "child stderr not piped")
        })?;

        let (read_tx, read_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (write_tx, write_rx) = mpsc::channel(CHANNEL_DEPTH);
        let cancel = CancellationToken::new();
        let stderr_log = Arc::new(StderrLog::new());

        let transport = Arc::new(Self {
            name: config.name.clone(),
            write_tx,
            stderr_log: Arc::clone(&stderr_log),
            cancel: cancel.clone(),
            stopped: AtomicBool::new(false),
            child: Mutex::new(Some(child)),
            tasks: Mutex::new(Vec::new()),
            output: output.clone(),
        });

        let read_task = tokio::spawn(read_loop(
            config.name.clone(),
            stdout,
            read_tx,
            cancel.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            config.name.clone(),
            stdin,
            write_rx,
            cancel.clone(),
        ));
        let stderr_task = tokio::spawn(stderr_loop(config.name, child_stderr, stderr_log, output));

        if let Ok(mut tasks) = transport.tasks.try_lock() {
            tasks.push(read_task);
            tasks.push(write_task);
            tasks.push(stderr_task);
        }

        Ok((transport, read_rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues one outbound message. Returns `SERVER_STOPPED` after
    /// [`StdioTransport::stop`].
    pub async fn write(&self, msg: JsonRpcMessage) -> Result<(), WeftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(
                WeftError::new(ErrorCode::ServerStopped, "transport is stopped")
                    .with_context("server", &self.name),
            );
        }
        self.write_tx.send(msg).await.map_err(|_| {
            WeftError::new(ErrorCode::ServerStopped, "write loop has exited")
                .with_context("server", &self.name)
        })
    }

    /// Whether any stderr line was classified as a real error.
    pub fn has_real_errors(&self) -> bool {
        self.stderr_log.has_real_errors()
    }

    /// Verbatim stderr buffer, for diagnostics.
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_log.lines()
    }

    /// Stops the transport: cancels the tasks, closes the child's stdin
    /// (letting it exit on EOF), force-kills after a grace period, waits for
    /// exit, then emits the filtered real-error stderr summary when one was
    /// recorded. Safe to call multiple times and from any task.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.name, %status, "server exited");
                }
                Ok(Err(e)) => warn!(server = %self.name, error = %e, "wait failed"),
                Err(_) => {
                    debug!(server = %self.name, "grace period elapsed, killing");
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.name, error = %e, "kill failed");
                    }
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        if self.stderr_log.has_real_errors() {
            self.output
                .error(&format!("server {:?} reported errors:", self.name));
            for line in self.stderr_log.real_error_lines() {
                self.output.error(&format!("  {line}"));
            }
        }
    }
}

/// Reads one newline-terminated line, enforcing `cap` on its length.
///
/// Returns `Ok(true)` when a line (or final unterminated chunk) landed in
/// `buf`, `Ok(false)` on EOF with nothing read. An over-long line is drained
/// to its newline and reported as `REQUEST_TOO_LARGE`.
pub(crate) async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> Result<bool, WeftError> {
    buf.clear();
    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| WeftError::new(ErrorCode::Internal, "pipe read failed").with_cause(e))?;
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }
        let (chunk, found_newline) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..pos], true),
            None => (available, false),
        };
        if buf.len() + chunk.len() > cap {
            let consumed = chunk.len() + usize::from(found_newline);
            reader.consume(consumed);
            if !found_newline {
                drain_to_newline(reader).await;
            }
            return Err(WeftError::new(
                ErrorCode::RequestTooLarge,
                format!("line exceeds {cap} byte cap"),
            ));
        }
        buf.extend_from_slice(chunk);
        let consumed = chunk.len() + usize::from(found_newline);
        reader.consume(consumed);
        if found_newline {
            return Ok(true);
        }
    }
}

async fn drain_to_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    loop {
        let available = match reader.fill_buf().await {
            Ok(a) => a,
            Err(_) => return,
        };
        if available.is_empty() {
            return;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return;
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

async fn read_loop(
    name: String,
    stdout: tokio::process::ChildStdout,
    read_tx: mpsc::Sender<JsonRpcMessage>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES) => read,
        };
        match read {
            Ok(true) => {}
            Ok(false) => {
                debug!(server = %name, "stdout closed");
                break;
            }
            Err(e) if e.code == ErrorCode::RequestTooLarge => {
                error!(server = %name, "{e}; discarding line");
                continue;
            }
            Err(e) => {
                warn!(server = %name, error = %e, "stdout read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
            Ok(msg) => {
                if read_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                debug!(server = %name, line = %trimmed, "discarding non-JSON stdout line");
            }
        }
    }
}

async fn write_loop(
    name: String,
    stdin: tokio::process::ChildStdin,
    mut write_rx: mpsc::Receiver<JsonRpcMessage>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::new(stdin);
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let mut bytes = match serde_json::to_vec(&msg) {
            Ok(b) => b,
            Err(e) => {
                error!(server = %name, error = %e, "failed to encode outbound message");
                continue;
            }
        };
        bytes.push(b'\n');
        if let Err(e) = writer.write_all(&bytes).await {
            // Write errors are fatal to the client.
            error!(server = %name, error = %e, "stdin write failed");
            cancel.cancel();
            break;
        }
        if let Err(e) = writer.flush().await {
            error!(server = %name, error = %e, "stdin flush failed");
            cancel.cancel();
            break;
        }
    }
    // Dropping the writer closes the child's stdin; a well-behaved server
    // exits on EOF, which is the graceful half of stop().
}

/// Drains stderr to EOF. No cancellation branch: the pipe closes when the
/// child dies, and draining fully means no buffered line is lost to a
/// shutdown race.
async fn stderr_loop(
    name: String,
    child_stderr: tokio::process::ChildStderr,
    log: Arc<StderrLog>,
    output: OutputWriter,
) {
    let mut reader = BufReader::new(child_stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                let real = log.record(trimmed);
                output.mirror_stderr(&name, trimmed, real);
            }
            Err(e) => {
                debug!(server = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Verbosity;

    fn quiet() -> OutputWriter {
        OutputWriter::with_sink(Verbosity::Quiet, Box::new(std::io::sink()))
    }

    #[tokio::test]
    async fn capped_read_accepts_line_at_cap() {
        let cap = 64;
        let mut data = vec![b'a'; cap];
        data.push(b'\n');
        let mut reader = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        assert!(read_line_capped(&mut reader, &mut buf, cap).await.unwrap());
        assert_eq!(buf.len(), cap);
    }

    #[tokio::test]
    async fn capped_read_rejects_line_over_cap() {
        let cap = 64;
        let mut data = vec![b'a'; cap + 1];
        data.push(b'\n');
        data.extend_from_slice(b"next\n");
        let mut reader = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        let err = read_line_capped(&mut reader, &mut buf, cap)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestTooLarge);
        // The oversize line is drained; the next line is intact.
        assert!(read_line_capped(&mut reader, &mut buf, cap).await.unwrap());
        assert_eq!(buf, b"next");
    }

    #[tokio::test]
    async fn full_size_line_survives_intact() {
        let payload = "x".repeat(MAX_LINE_BYTES - 2);
        let mut data = payload.clone().into_bytes();
        data.push(b'\n');
        let mut reader = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        assert!(
            read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES)
                .await
                .unwrap()
        );
        assert_eq!(buf.len(), payload.len());
    }

    #[tokio::test]
    async fn spawn_failure_is_server_start_failed() {
        let config = TransportConfig {
            name: "ghost".into(),
            command: "/nonexistent/binary".into(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let err = StdioTransport::spawn(config, quiet()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerStartFailed);
    }

    #[tokio::test]
    async fn reads_json_lines_and_skips_noise() {
        let config = TransportConfig {
            name: "echo".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"echo 'not json'; echo '{"jsonrpc":"2.0","id":1,"result":{}}'"#.into(),
            ],
            env: BTreeMap::new(),
        };
        let (transport, mut rx) = StdioTransport::spawn(config, quiet()).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("one message");
        assert_eq!(msg.id_key().as_deref(), Some("1"));
        transport.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_write_after_stop_fails() {
        let config = TransportConfig {
            name: "cat".into(),
            command: "cat".into(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let (transport, _rx) = StdioTransport::spawn(config, quiet()).unwrap();
        transport.stop().await;
        transport.stop().await;
        let err = transport
            .write(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerStopped);
    }

    #[tokio::test]
    async fn stderr_is_buffered_and_classified() {
        let config = TransportConfig {
            name: "noisy".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                "echo 'info: loading configuration' 1>&2; echo 'error: connection refused' 1>&2"
                    .into(),
            ],
            env: BTreeMap::new(),
        };
        let (transport, mut rx) = StdioTransport::spawn(config, quiet()).unwrap();
        // Wait for the child to exit and the read loop to see EOF.
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        transport.stop().await;
        assert!(transport.has_real_errors());
        let lines = transport.stderr_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("loading configuration"));
    }
}
