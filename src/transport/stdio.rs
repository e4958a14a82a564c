//! Stdio transport for MCP
//!
//! Frames are newline-delimited JSON. [`StdioServerTransport`] serves over
//! the current process's stdin/stdout; [`ChildProcessTransport`] spawns an
//! MCP server as a child process and talks to its pipes, draining stderr to
//! a diagnostic sink.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::codec::Frame;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::JsonRpcResponse;
use crate::transport::{
    closed_channel, CloseCause, ClosedNotifier, ClosedSignal, FrameReceiver, FrameSender,
    Transport, DEFAULT_CLOSE_GRACE, DEFAULT_SEND_BUFFER,
};

/// Reader loop: one JSON frame per line.
///
/// `reply_on_parse_error` selects the role behavior: a server answers
/// malformed frames with -32700, a client logs and drops them.
async fn read_frames<R>(
    reader: R,
    inbound: mpsc::Sender<Frame>,
    outbound: mpsc::Sender<Frame>,
    closed: Arc<ClosedNotifier>,
    reply_on_parse_error: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdio peer closed the stream");
                closed.notify(CloseCause::Closed);
                break;
            }
            Err(e) => {
                closed.notify(CloseCause::Fatal(format!("stdio read failed: {}", e)));
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match Frame::decode(trimmed) {
            Ok(frame) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed stdio frame");
                if reply_on_parse_error {
                    let error = match &e {
                        Error::JsonRpc(rpc) => rpc.clone(),
                        other => JsonRpcError::parse_error(other.to_string()),
                    };
                    let reply = Frame::Response(JsonRpcResponse::error(None, error));
                    let _ = outbound.send(reply).await;
                }
            }
        }
    }
}

/// Writer loop: serialize outbound frames one per line, flush after each.
/// On close, drains whatever is already buffered within the grace window.
async fn write_frames<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    closed: Arc<ClosedNotifier>,
    grace: Duration,
) -> mpsc::Receiver<Frame>
where
    W: AsyncWrite + Unpin,
{
    async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
        let line = frame.encode()?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("stdio write failed: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(format!("stdio write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("stdio flush failed: {}", e)))?;
        Ok(())
    }

    let signal = closed.subscribe();
    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = write_one(&mut writer, &frame).await {
                        closed.notify(CloseCause::Fatal(e.to_string()));
                        break;
                    }
                }
                None => break,
            },
            _ = signal.wait() => {
                // Drain what is already queued, bounded by the grace window.
                let drain = async {
                    while let Ok(frame) = outbound.try_recv() {
                        if write_one(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                };
                let _ = tokio::time::timeout(grace, drain).await;
                break;
            }
        }
    }
    outbound
}

// ============================================================================
// Server side: current process stdin/stdout
// ============================================================================

/// Stdio transport for a server speaking over its own stdin/stdout.
pub struct StdioServerTransport {
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: Option<mpsc::Receiver<Frame>>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: Option<FrameReceiver>,
    closed: Arc<ClosedNotifier>,
    started: bool,
}

impl Default for StdioServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioServerTransport {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);
        Self {
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            closed: Arc::new(closed_channel()),
            started: false,
        }
    }
}

#[async_trait]
impl Transport for StdioServerTransport {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| Error::Internal("stdio transport already consumed".into()))?;

        tokio::spawn(read_frames(
            tokio::io::stdin(),
            self.inbound_tx.clone(),
            self.outbound_tx.clone(),
            self.closed.clone(),
            true,
        ));
        tokio::spawn(write_frames(
            tokio::io::stdout(),
            outbound_rx,
            self.closed.clone(),
            DEFAULT_CLOSE_GRACE,
        ));

        self.started = true;
        tracing::info!("stdio transport started");
        Ok(())
    }

    fn sender(&self) -> FrameSender {
        FrameSender::new(self.outbound_tx.clone())
    }

    fn incoming(&mut self) -> Option<FrameReceiver> {
        self.inbound_rx.take()
    }

    fn closed(&self) -> ClosedSignal {
        self.closed.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.notify(CloseCause::Closed);
        Ok(())
    }
}

// ============================================================================
// Client side: spawned child process
// ============================================================================

/// Where the child's stderr lines go.
///
/// Defaults to the process log via `tracing::warn!`.
pub type StderrSink = mpsc::Sender<String>;

/// Builder + transport for a child-process MCP server.
///
/// # Example
///
/// ```rust,no_run
/// use mcp_conduit::transport::stdio::ChildProcessTransport;
///
/// let transport = ChildProcessTransport::new("my-mcp-server")
///     .arg("--verbose")
///     .env("API_KEY", "secret");
/// ```
pub struct ChildProcessTransport {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stderr_sink: Option<StderrSink>,
    close_grace: Duration,

    child: Option<Child>,
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: Option<mpsc::Receiver<Frame>>,
    inbound_rx: Option<FrameReceiver>,
    closed: Arc<ClosedNotifier>,
}

impl ChildProcessTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_buffer(program, DEFAULT_SEND_BUFFER)
    }

    /// Like [`new`](Self::new) with an explicit outbound buffer bound.
    pub fn with_buffer(program: impl Into<String>, send_buffer: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(send_buffer);
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stderr_sink: None,
            close_grace: DEFAULT_CLOSE_GRACE,
            child: None,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_rx: None,
            closed: Arc::new(closed_channel()),
        }
    }

    /// Add a command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command-line arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Capture the child's stderr lines into a channel instead of the log.
    pub fn stderr_sink(mut self, sink: StderrSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    /// Override the shutdown grace window.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn {}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("child stderr unavailable".into()))?;

        tracing::info!(program = %self.program, "spawned MCP server process");

        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| Error::Internal("child transport already consumed".into()))?;
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);

        tokio::spawn(read_frames(
            stdout,
            inbound_tx,
            self.outbound_tx.clone(),
            self.closed.clone(),
            false,
        ));
        // The writer owns stdin; when it finishes its drain the drop closes
        // the pipe, which is the polite EOF the child is waiting on.
        let closed = self.closed.clone();
        let grace = self.close_grace;
        tokio::spawn(async move {
            let _ = write_frames(stdin, outbound_rx, closed, grace).await;
        });

        let program = self.program.clone();
        let sink = self.stderr_sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match &sink {
                    Some(tx) => {
                        let _ = tx.send(line).await;
                    }
                    None => tracing::warn!(program = %program, stderr = %line, "child diagnostic"),
                }
            }
        });

        self.child = Some(child);
        self.inbound_rx = Some(inbound_rx);
        Ok(())
    }

    fn sender(&self) -> FrameSender {
        FrameSender::new(self.outbound_tx.clone())
    }

    fn incoming(&mut self) -> Option<FrameReceiver> {
        self.inbound_rx.take()
    }

    fn closed(&self) -> ClosedSignal {
        self.closed.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.notify(CloseCause::Closed);

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // The writer drains and drops stdin inside the same grace window,
        // so one combined wait covers both.
        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(status = ?status, "child process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Transport(format!("child wait failed: {}", e))),
            Err(_) => {
                tracing::warn!("child did not exit in time, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| Error::Transport(format!("failed to kill child: {}", e)))?;
                Ok(())
            }
        }
    }
}
