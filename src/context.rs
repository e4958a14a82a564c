//! Request context for MCP handlers
//!
//! Every handler invocation receives a [`RequestContext`]: the request id,
//! the owning session, a cancellation signal, and channels for progress and
//! log notifications back to the client. Handlers are expected to observe
//! cancellation promptly, either by polling [`RequestContext::is_cancelled`]
//! inside loops or by racing their work against
//! [`CancellationToken::cancelled`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::protocol::{
    notifications, JsonRpcNotification, LogLevel, LoggingMessageParams, ProgressParams,
    ProgressToken, RequestId,
};

/// Sender half of a session's outbound notification mailbox.
///
/// Frames pushed here reach the client in push order.
pub type NotificationSender = mpsc::Sender<JsonRpcNotification>;

/// Receiver half of a session mailbox, drained by the transport.
pub type NotificationReceiver = mpsc::Receiver<JsonRpcNotification>;

/// Create a new bounded notification mailbox.
pub fn notification_channel(buffer: usize) -> (NotificationSender, NotificationReceiver) {
    mpsc::channel(buffer)
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation signal shared between the engine and a handler.
///
/// Cloning is cheap; all clones observe the same state. Cancellation is
/// one-way and permanent.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation, waking every task parked in [`cancelled`].
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    /// Resolve once cancellation has been requested. Resolves immediately if
    /// it already was.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register as a waiter before re-checking the flag so a cancel
            // landing between the check and the await cannot be missed.
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shared, atomically updated minimum log level for a session.
///
/// `logging/setLevel` stores into it; [`RequestContext::log`] reads it.
#[derive(Clone)]
pub struct LogLevelGate {
    rank: Arc<AtomicU8>,
}

impl Default for LogLevelGate {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogLevelGate {
    pub fn new(level: LogLevel) -> Self {
        Self {
            rank: Arc::new(AtomicU8::new(rank(level))),
        }
    }

    pub fn set(&self, level: LogLevel) {
        self.rank.store(rank(level), Ordering::Relaxed);
    }

    /// Would a message at `level` pass the current threshold?
    pub fn allows(&self, level: LogLevel) -> bool {
        rank(level) <= self.rank.load(Ordering::Relaxed)
    }
}

fn rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Emergency => 0,
        LogLevel::Alert => 1,
        LogLevel::Critical => 2,
        LogLevel::Error => 3,
        LogLevel::Warning => 4,
        LogLevel::Notice => 5,
        LogLevel::Info => 6,
        LogLevel::Debug => 7,
    }
}

/// Context handed to every server-side handler invocation.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    session_id: Option<String>,
    progress_token: Option<ProgressToken>,
    cancel: CancellationToken,
    mailbox: Option<NotificationSender>,
    log_gate: LogLevelGate,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("session_id", &self.session_id)
            .field("progress_token", &self.progress_token)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RequestContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            session_id: None,
            progress_token: None,
            cancel: CancellationToken::new(),
            mailbox: None,
            log_gate: LogLevelGate::default(),
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_progress_token(mut self, token: ProgressToken) -> Self {
        self.progress_token = Some(token);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_mailbox(mut self, tx: NotificationSender) -> Self {
        self.mailbox = Some(tx);
        self
    }

    pub fn with_log_gate(mut self, gate: LogLevelGate) -> Self {
        self.log_gate = gate;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The owning session's id, once the session exists (dispatches during
    /// the initialize exchange have none).
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The shareable cancellation token for this request.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Report progress to the client.
    ///
    /// No-op when the request carried no progress token or the context has
    /// no mailbox. Best effort: a full mailbox drops the update rather than
    /// blocking the handler.
    pub fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        let (Some(token), Some(tx)) = (&self.progress_token, &self.mailbox) else {
            return;
        };
        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message: message.map(str::to_owned),
        };
        let notif = JsonRpcNotification::new(notifications::PROGRESS)
            .with_params(serde_json::to_value(params).unwrap_or_default());
        if tx.try_send(notif).is_err() {
            tracing::debug!(request_id = %self.request_id, "progress notification dropped");
        }
    }

    /// Emit a `notifications/message` log record, filtered by the session's
    /// `logging/setLevel` threshold.
    pub fn log(&self, level: LogLevel, logger: Option<&str>, data: serde_json::Value) {
        let Some(tx) = &self.mailbox else {
            return;
        };
        if !self.log_gate.allows(level) {
            return;
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(str::to_owned),
            data: Some(data),
        };
        let notif = JsonRpcNotification::new(notifications::MESSAGE)
            .with_params(serde_json::to_value(params).unwrap_or_default());
        let _ = tx.try_send(notif);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_flag() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        // Must not hang.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_progress_requires_token() {
        let (tx, mut rx) = notification_channel(4);
        let ctx = RequestContext::new(RequestId::Number(1)).with_mailbox(tx);
        ctx.report_progress(0.5, Some(1.0), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_progress_emitted_with_token() {
        let (tx, mut rx) = notification_channel(4);
        let ctx = RequestContext::new(RequestId::Number(1))
            .with_progress_token(ProgressToken::Number(9))
            .with_mailbox(tx);
        ctx.report_progress(3.0, Some(10.0), Some("working"));
        let n = rx.try_recv().unwrap();
        assert_eq!(n.method, notifications::PROGRESS);
        let params = n.params.unwrap();
        assert_eq!(params["progressToken"], 9);
        assert_eq!(params["progress"], 3.0);
    }

    #[tokio::test]
    async fn test_log_gate_filters() {
        let (tx, mut rx) = notification_channel(4);
        let gate = LogLevelGate::new(LogLevel::Warning);
        let ctx = RequestContext::new(RequestId::Number(1))
            .with_mailbox(tx)
            .with_log_gate(gate.clone());

        ctx.log(LogLevel::Debug, None, serde_json::json!("chatter"));
        assert!(rx.try_recv().is_err());

        ctx.log(LogLevel::Error, Some("db"), serde_json::json!("boom"));
        let n = rx.try_recv().unwrap();
        assert_eq!(n.method, notifications::MESSAGE);

        gate.set(LogLevel::Debug);
        ctx.log(LogLevel::Debug, None, serde_json::json!("now visible"));
        assert!(rx.try_recv().is_ok());
    }
}
