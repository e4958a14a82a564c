//! Request correlator
//!
//! Pairs outgoing requests with incoming responses by id. Each in-flight
//! request owns a one-shot delivery slot; the waiter races the slot against
//! its cancellation token, the transport's closed signal, and a timeout.
//! Whichever fires first wins and the slot is removed, so at most one
//! delivery ever reaches the caller.
//!
//! Cancellation (explicit or by timeout) additionally emits a best-effort
//! `$/cancelled` notification carrying the request id; no confirmation is
//! awaited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec::Frame;
use crate::context::CancellationToken;
use crate::error::{Error, Result};
use crate::protocol::{
    notifications, CancelledParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ProgressToken, RequestId,
};
use crate::transport::{ClosedSignal, FrameSender};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request knobs accepted by every operation.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline override; the engine default applies when `None`.
    pub timeout: Option<Duration>,
    /// Caller-held cancellation signal.
    pub cancel: Option<CancellationToken>,
    /// Progress token to attach under `params._meta.progressToken`.
    pub progress_token: Option<ProgressToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn progress_token(mut self, token: ProgressToken) -> Self {
        self.progress_token = Some(token);
        self
    }
}

type Slot = oneshot::Sender<JsonRpcResponse>;

/// Correlates responses to requests on one connection.
///
/// Cloneable; clones share the pending-slot map.
#[derive(Clone)]
pub struct Correlator {
    sender: FrameSender,
    closed: ClosedSignal,
    pending: Arc<Mutex<HashMap<RequestId, Slot>>>,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(sender: FrameSender, closed: ClosedSignal, default_timeout: Duration) -> Self {
        Self {
            sender,
            closed,
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Send a request and wait for its response, honoring the options'
    /// timeout and cancellation.
    pub async fn request(
        &self,
        request: JsonRpcRequest,
        options: &RequestOptions,
    ) -> Result<serde_json::Value> {
        let id = request.id.clone();
        let mut rx = self.register(id.clone())?;

        if let Err(e) = self.sender.send(Frame::Request(request)) {
            self.remove(&id);
            return Err(e);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let cancel = options.cancel.clone().unwrap_or_default();

        tokio::select! {
            delivered = &mut rx => match delivered {
                Ok(response) => response.into_result().map_err(Error::JsonRpc),
                // Slot dropped by fail_all: the transport is gone.
                Err(_) => Err(self.closed.error()),
            },
            _ = cancel.cancelled() => {
                self.abandon(&id, "cancelled");
                Err(Error::Cancelled)
            }
            err = self.closed.wait() => {
                self.remove(&id);
                Err(err)
            }
            _ = tokio::time::sleep(timeout) => {
                self.abandon(&id, "timeout");
                Err(Error::Timeout)
            }
        }
    }

    /// Send a one-way notification.
    pub fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.sender.send(Frame::Notification(notification))
    }

    /// Route an inbound response to its slot. Stale responses (no matching
    /// slot, including duplicates) are dropped with a debug log.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id().cloned() else {
            tracing::debug!("dropping response without id");
            return false;
        };
        let slot = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(&id);
        match slot {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::debug!(id = %id, "dropping response with no outstanding request");
                false
            }
        }
    }

    /// Fail every in-flight request. Waiters observe the transport's closing
    /// error. Called when the inbound stream ends.
    pub fn fail_all(&self) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        // Dropping the slots wakes the waiters with a recv error.
        drop(drained);
    }

    /// Number of requests currently awaiting responses.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }

    fn register(&self, id: RequestId) -> Result<oneshot::Receiver<JsonRpcResponse>> {
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        if pending.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    fn remove(&self, id: &RequestId) {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id);
    }

    /// Remove the slot and tell the peer we stopped caring. Best effort.
    fn abandon(&self, id: &RequestId, reason: &str) {
        self.remove(id);
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let notification = JsonRpcNotification::new(notifications::CANCELLED)
            .with_params(serde_json::to_value(params).unwrap_or_default());
        if self.notify(notification).is_err() {
            tracing::debug!(id = %id, "cancellation notification not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods;
    use crate::transport::{closed_channel, CloseCause};
    use tokio::sync::mpsc;

    fn correlator() -> (Correlator, mpsc::Receiver<Frame>, Arc<crate::transport::ClosedNotifier>) {
        let (tx, rx) = mpsc::channel(16);
        let notifier = Arc::new(closed_channel());
        let c = Correlator::new(
            FrameSender::new(tx),
            notifier.subscribe(),
            Duration::from_secs(5),
        );
        (c, rx, notifier)
    }

    #[tokio::test]
    async fn test_response_resolves_request() {
        let (c, mut wire, _n) = correlator();

        let resolver = c.clone();
        let handle = tokio::spawn(async move {
            resolver
                .request(
                    JsonRpcRequest::new(1, methods::PING),
                    &RequestOptions::default(),
                )
                .await
        });

        // The request reaches the wire.
        let sent = wire.recv().await.unwrap();
        let Frame::Request(req) = sent else {
            panic!("expected request frame");
        };
        assert_eq!(req.method, "ping");

        c.resolve(JsonRpcResponse::result(
            RequestId::Number(1),
            serde_json::json!({}),
        ));
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({}));
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_response_dropped() {
        let (c, _wire, _n) = correlator();
        assert!(!c.resolve(JsonRpcResponse::result(
            RequestId::Number(42),
            serde_json::json!({}),
        )));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (c, _wire, _n) = correlator();
        let _rx = c.register(RequestId::Number(1)).unwrap();
        let err = c.register(RequestId::Number(1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
        // A string id spelled the same does not collide.
        assert!(c.register(RequestId::String("1".into())).is_ok());
    }

    #[tokio::test]
    async fn test_at_most_one_delivery() {
        let (c, _wire, _n) = correlator();
        let rx = c.register(RequestId::Number(1)).unwrap();

        assert!(c.resolve(JsonRpcResponse::result(
            RequestId::Number(1),
            serde_json::json!({"first": true}),
        )));
        // The duplicate finds no slot.
        assert!(!c.resolve(JsonRpcResponse::result(
            RequestId::Number(1),
            serde_json::json!({"second": true}),
        )));

        let delivered = rx.await.unwrap();
        let value = delivered.into_result().unwrap();
        assert_eq!(value["first"], true);
    }

    #[tokio::test]
    async fn test_cancel_emits_cancelled_notification() {
        let (c, mut wire, _n) = correlator();
        let token = CancellationToken::new();
        let options = RequestOptions::new().cancel_token(token.clone());

        let requester = c.clone();
        let handle = tokio::spawn(async move {
            requester
                .request(JsonRpcRequest::new(7, methods::TOOLS_CALL), &options)
                .await
        });

        // Skip past the request frame, then cancel.
        let _ = wire.recv().await.unwrap();
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let frame = wire.recv().await.unwrap();
        let Frame::Notification(n) = frame else {
            panic!("expected cancellation notification");
        };
        assert_eq!(n.method, notifications::CANCELLED);
        assert_eq!(n.params.unwrap()["requestId"], 7);
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_cancellation_cause() {
        let (c, mut wire, _n) = correlator();
        let options = RequestOptions::new().timeout(Duration::from_millis(50));

        let requester = c.clone();
        let handle = tokio::spawn(async move {
            requester
                .request(JsonRpcRequest::new(9, methods::PING), &options)
                .await
        });

        let _ = wire.recv().await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // Timeout also tells the peer to stop.
        let frame = wire.recv().await.unwrap();
        assert!(matches!(frame, Frame::Notification(_)));
    }

    #[tokio::test]
    async fn test_transport_close_fails_waiters() {
        let (c, mut wire, notifier) = correlator();

        let requester = c.clone();
        let handle = tokio::spawn(async move {
            requester
                .request(
                    JsonRpcRequest::new(3, methods::PING),
                    &RequestOptions::default(),
                )
                .await
        });

        let _ = wire.recv().await.unwrap();
        notifier.notify(CloseCause::Closed);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }

    #[tokio::test]
    async fn test_fail_all_uses_closing_cause() {
        let (c, mut wire, notifier) = correlator();

        let requester = c.clone();
        let handle = tokio::spawn(async move {
            requester
                .request(
                    JsonRpcRequest::new(4, methods::PING),
                    &RequestOptions::default(),
                )
                .await
        });

        let _ = wire.recv().await.unwrap();
        notifier.notify(CloseCause::SessionLost);
        c.fail_all();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionLost));
    }

    #[tokio::test]
    async fn test_peer_error_surfaces() {
        let (c, mut wire, _n) = correlator();

        let requester = c.clone();
        let handle = tokio::spawn(async move {
            requester
                .request(
                    JsonRpcRequest::new(5, "tools/call"),
                    &RequestOptions::default(),
                )
                .await
        });

        let _ = wire.recv().await.unwrap();
        c.resolve(JsonRpcResponse::error(
            Some(RequestId::Number(5)),
            crate::error::JsonRpcError::method_not_found("tools/call"),
        ));

        let err = handle.await.unwrap().unwrap_err();
        match err {
            Error::JsonRpc(e) => assert_eq!(e.code, -32601),
            other => panic!("expected JSON-RPC error, got {other:?}"),
        }
    }
}
