//! Session state and the session manager
//!
//! A [`Session`] is one connected peer: the server-assigned id, the
//! negotiated protocol version, the client's advertised capabilities, an
//! outbound notification mailbox, the resource-subscription set, and a
//! session-scoped cancellation token that fires at teardown.
//!
//! The connection itself moves through phases (Uninitialized, Initializing,
//! Initialized) tracked with an atomic so the hot path never locks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::context::{
    notification_channel, CancellationToken, LogLevelGate, NotificationReceiver,
    NotificationSender,
};
use crate::protocol::{ClientCapabilities, Implementation, JsonRpcNotification, RequestId};

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    /// Only `initialize` and `ping` are valid
    Uninitialized = 0,
    /// Initialize response sent, waiting for the `initialized` notification
    Initializing = 1,
    /// Normal operation
    Initialized = 2,
}

impl From<u8> for SessionPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => SessionPhase::Initializing,
            2 => SessionPhase::Initialized,
            _ => SessionPhase::Uninitialized,
        }
    }
}

/// Atomic phase machine shared by everything touching one connection.
#[derive(Clone)]
pub struct PhaseState {
    phase: Arc<AtomicU8>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseState {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(SessionPhase::Uninitialized as u8)),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == SessionPhase::Initialized
    }

    /// Uninitialized → Initializing; called after the initialize response.
    pub fn mark_initializing(&self) -> bool {
        self.phase
            .compare_exchange(
                SessionPhase::Uninitialized as u8,
                SessionPhase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transition to Initialized on the `initialized` notification.
    ///
    /// Also accepts Uninitialized → Initialized: over HTTP the notification
    /// can overtake the initialize response's bookkeeping.
    pub fn mark_initialized(&self) -> bool {
        for from in [SessionPhase::Initializing, SessionPhase::Uninitialized] {
            if self
                .phase
                .compare_exchange(
                    from as u8,
                    SessionPhase::Initialized as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Is `method` acceptable in the current phase?
    pub fn is_request_allowed(&self, method: &str) -> bool {
        match self.phase() {
            SessionPhase::Uninitialized => matches!(method, "initialize" | "ping"),
            SessionPhase::Initializing | SessionPhase::Initialized => true,
        }
    }
}

/// Immutable view of a session handed to hook chains.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub protocol_version: String,
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
}

/// A connected peer relationship, created on successful initialize and
/// destroyed on transport close or explicit unregister.
pub struct Session {
    id: String,
    protocol_version: String,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    mailbox: NotificationSender,
    subscriptions: RwLock<HashSet<String>>,
    in_flight: RwLock<HashMap<RequestId, CancellationToken>>,
    cancel: CancellationToken,
    phase: PhaseState,
    log_gate: LogLevelGate,
}

impl Session {
    pub(crate) fn new(
        id: String,
        protocol_version: String,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        mailbox: NotificationSender,
        phase: PhaseState,
    ) -> Self {
        Self {
            id,
            protocol_version,
            client_info,
            capabilities,
            mailbox,
            subscriptions: RwLock::new(HashSet::new()),
            in_flight: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            phase,
            log_gate: LogLevelGate::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn client_info(&self) -> &Implementation {
        &self.client_info
    }

    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    pub fn phase(&self) -> &PhaseState {
        &self.phase
    }

    pub(crate) fn log_gate(&self) -> &LogLevelGate {
        &self.log_gate
    }

    pub(crate) fn mailbox_sender(&self) -> NotificationSender {
        self.mailbox.clone()
    }

    /// Session-scoped cancellation; fires when the session is torn down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            protocol_version: self.protocol_version.clone(),
            client_info: self.client_info.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    /// Queue a notification for this session. Emission order is preserved
    /// on delivery; a full mailbox drops the frame rather than block.
    pub fn notify(&self, notification: JsonRpcNotification) {
        if self.mailbox.try_send(notification).is_err() {
            tracing::debug!(session_id = %self.id, "session mailbox full, notification dropped");
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Add a subscription. Idempotent.
    pub fn subscribe(&self, uri: impl Into<String>) {
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .insert(uri.into());
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, uri: &str) {
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .remove(uri);
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions
            .read()
            .expect("subscription lock poisoned")
            .contains(uri)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription lock poisoned")
            .len()
    }

    // ------------------------------------------------------------------
    // In-flight request tracking
    // ------------------------------------------------------------------

    /// Track a dispatched request so `$/cancelled` can reach its handler.
    pub(crate) fn track(&self, id: RequestId, token: CancellationToken) {
        self.in_flight
            .write()
            .expect("in-flight lock poisoned")
            .insert(id, token);
    }

    pub(crate) fn untrack(&self, id: &RequestId) {
        self.in_flight
            .write()
            .expect("in-flight lock poisoned")
            .remove(id);
    }

    /// Cancel one in-flight request. Returns whether it was found.
    pub(crate) fn cancel_request(&self, id: &RequestId) -> bool {
        let token = self
            .in_flight
            .read()
            .expect("in-flight lock poisoned")
            .get(id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down: cancel the session token and every in-flight handler,
    /// and drop all subscriptions.
    pub(crate) fn teardown(&self) {
        self.cancel.cancel();
        let tokens: Vec<CancellationToken> = {
            let mut in_flight = self.in_flight.write().expect("in-flight lock poisoned");
            in_flight.drain().map(|(_, t)| t).collect()
        };
        for token in tokens {
            token.cancel();
        }
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .clear();
    }
}

/// Tracks connected sessions by id and owns their mailboxes.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id and register the record. Returns the session
    /// and the receiving half of its mailbox for the transport to drain.
    pub fn register(
        &self,
        protocol_version: String,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        phase: PhaseState,
        mailbox_buffer: usize,
    ) -> (Arc<Session>, NotificationReceiver) {
        let (tx, rx) = notification_channel(mailbox_buffer);
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            protocol_version,
            client_info,
            capabilities,
            tx,
            phase,
        ));
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, "session registered");
        (session, rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .get(id)
            .cloned()
    }

    /// Drop a session, cancelling its in-flight work. Returns the removed
    /// record so callers can fire unregister hooks.
    pub fn unregister(&self, id: &str) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .write()
            .expect("session table lock poisoned")
            .remove(id);
        if let Some(ref session) = session {
            session.teardown();
            tracing::debug!(session_id = %id, "session unregistered");
        }
        session
    }

    /// Snapshot of all live sessions, for notification fan-out.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_register(manager: &SessionManager) -> (Arc<Session>, NotificationReceiver) {
        manager.register(
            "2024-11-05".into(),
            Implementation {
                name: "test-client".into(),
                version: "0.0.1".into(),
            },
            ClientCapabilities::default(),
            PhaseState::new(),
            16,
        )
    }

    #[test]
    fn test_phase_lifecycle() {
        let phase = PhaseState::new();
        assert_eq!(phase.phase(), SessionPhase::Uninitialized);
        assert!(phase.is_request_allowed("initialize"));
        assert!(phase.is_request_allowed("ping"));
        assert!(!phase.is_request_allowed("tools/list"));

        assert!(phase.mark_initializing());
        assert!(!phase.mark_initializing());
        assert!(phase.is_request_allowed("tools/list"));

        assert!(phase.mark_initialized());
        assert!(!phase.mark_initialized());
        assert!(phase.is_initialized());
    }

    #[test]
    fn test_initialized_notification_can_overtake() {
        let phase = PhaseState::new();
        assert!(phase.mark_initialized());
        assert!(phase.is_initialized());
    }

    #[test]
    fn test_subscribe_idempotent() {
        let manager = SessionManager::new();
        let (session, _rx) = manager_register(&manager);

        session.subscribe("users://42");
        session.subscribe("users://42");
        assert_eq!(session.subscription_count(), 1);
        assert!(session.is_subscribed("users://42"));

        session.unsubscribe("users://42");
        session.unsubscribe("users://42");
        assert_eq!(session.subscription_count(), 0);
    }

    #[test]
    fn test_unregister_cancels_in_flight() {
        let manager = SessionManager::new();
        let (session, _rx) = manager_register(&manager);
        let id = session.id().to_string();

        let token = CancellationToken::new();
        session.track(RequestId::Number(5), token.clone());
        let session_token = session.cancellation_token();

        let removed = manager.unregister(&id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(token.is_cancelled());
        assert!(session_token.is_cancelled());
        assert_eq!(removed.subscription_count(), 0);
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn test_cancel_request_by_id() {
        let manager = SessionManager::new();
        let (session, _rx) = manager_register(&manager);

        let token = CancellationToken::new();
        session.track(RequestId::String("r-1".into()), token.clone());

        assert!(session.cancel_request(&RequestId::String("r-1".into())));
        assert!(token.is_cancelled());
        assert!(!session.cancel_request(&RequestId::Number(99)));
    }

    #[tokio::test]
    async fn test_notify_preserves_order() {
        let manager = SessionManager::new();
        let (session, mut rx) = manager_register(&manager);

        session.notify(JsonRpcNotification::new("notifications/tools/list_changed"));
        session.notify(JsonRpcNotification::new(
            "notifications/resources/list_changed",
        ));

        assert_eq!(
            rx.recv().await.unwrap().method,
            "notifications/tools/list_changed"
        );
        assert_eq!(
            rx.recv().await.unwrap().method,
            "notifications/resources/list_changed"
        );
    }

    #[test]
    fn test_session_ids_unique() {
        let manager = SessionManager::new();
        let (a, _ra) = manager_register(&manager);
        let (b, _rb) = manager_register(&manager);
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len(), 2);
    }
}
