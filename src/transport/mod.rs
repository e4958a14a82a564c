//! Transport abstraction for MCP
//!
//! A transport carries classified [`Frame`]s between peers. Four
//! implementations ship with the crate:
//!
//! - [`stdio`]: newline-delimited JSON over a child process's stdin/stdout
//!   (client side) or the current process's (server side)
//! - [`sse`]: server-sent events stream down, HTTP POST up
//! - [`streamable`]: single-endpoint streamable HTTP with session ids
//! - [`inprocess`]: paired bounded channels, no serialization
//!
//! Every transport owns exactly one reader task and one writer task.
//! Outbound frames are enqueued with [`FrameSender::send`], which never
//! blocks: a full buffer fails fast with `BackpressureFull` and a closed
//! transport with `TransportClosed`. Inbound frames arrive on the receiver
//! returned by [`Transport::incoming`]; the channel ends when the transport
//! closes, and [`ClosedSignal`] carries the fatal cause.

pub mod inprocess;
pub mod sse;
pub mod stdio;
pub mod streamable;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::codec::Frame;
use crate::error::{Error, Result};

/// Default bound on the outbound frame buffer.
pub const DEFAULT_SEND_BUFFER: usize = 64;

/// How long `close()` waits for pending sends to drain before cancelling
/// them.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Inbound frame stream handed to the engine; ends at transport close.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Why a transport stopped.
#[derive(Debug, Clone)]
pub enum CloseCause {
    /// Orderly local or remote shutdown.
    Closed,
    /// The server stopped recognizing our session id (streamable HTTP 404).
    SessionLost,
    /// Unrecoverable transport-level failure.
    Fatal(String),
}

impl CloseCause {
    pub fn to_error(&self) -> Error {
        match self {
            CloseCause::Closed => Error::TransportClosed,
            CloseCause::SessionLost => Error::SessionLost,
            CloseCause::Fatal(msg) => Error::Transport(msg.clone()),
        }
    }
}

/// Handle for enqueuing outbound frames. Cloneable; all clones feed the
/// transport's single writer task, so frames from one sender reach the wire
/// in enqueue order.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Enqueue a frame without blocking.
    pub fn send(&self, frame: Frame) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::BackpressureFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::TransportClosed),
        }
    }

    /// Enqueue a frame, waiting for buffer space. Used where the caller has
    /// opted into blocking (e.g. notification fan-out under its own task).
    pub async fn send_wait(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ClosedShared {
    cause: Mutex<Option<CloseCause>>,
}

/// Awaitable signal that resolves when the transport has closed, carrying
/// the closing cause.
#[derive(Clone)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
    shared: Arc<ClosedShared>,
}

impl ClosedSignal {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// The error equivalent of the closing cause; `TransportClosed` when the
    /// transport is still open or closed without a recorded cause.
    pub fn error(&self) -> Error {
        self.shared
            .cause
            .lock()
            .expect("close cause lock poisoned")
            .as_ref()
            .map(CloseCause::to_error)
            .unwrap_or(Error::TransportClosed)
    }

    /// Wait until the transport closes, then return the cause as an error.
    pub async fn wait(&self) -> Error {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.error()
    }
}

/// Producer side of a [`ClosedSignal`]; owned by the transport.
pub(crate) struct ClosedNotifier {
    tx: watch::Sender<bool>,
    shared: Arc<ClosedShared>,
}

impl ClosedNotifier {
    /// Mark the transport closed. The first cause wins; later calls only
    /// re-fire the watch.
    pub(crate) fn notify(&self, cause: CloseCause) {
        {
            let mut slot = self.shared.cause.lock().expect("close cause lock poisoned");
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        let _ = self.tx.send(true);
    }

    pub(crate) fn subscribe(&self) -> ClosedSignal {
        ClosedSignal {
            rx: self.tx.subscribe(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

pub(crate) fn closed_channel() -> ClosedNotifier {
    let (tx, _rx) = watch::channel(false);
    ClosedNotifier {
        tx,
        shared: Arc::new(ClosedShared {
            cause: Mutex::new(None),
        }),
    }
}

/// Byte-level carrier of JSON-RPC frames.
#[async_trait]
pub trait Transport: Send {
    /// Begin I/O, spawning the reader and writer tasks. Idempotent after
    /// success.
    async fn start(&mut self) -> Result<()>;

    /// Handle for enqueuing outbound frames.
    fn sender(&self) -> FrameSender;

    /// Take the inbound frame stream. Yields `Some` exactly once, after
    /// `start` has succeeded.
    fn incoming(&mut self) -> Option<FrameReceiver>;

    /// Signal that resolves when the transport closes.
    fn closed(&self) -> ClosedSignal;

    /// Initiate shutdown: drain pending sends up to a grace deadline, then
    /// cancel them with `TransportClosed`.
    async fn close(&mut self) -> Result<()>;
}
