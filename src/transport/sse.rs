//! SSE transport for MCP
//!
//! Server-to-client frames travel on a long-lived `GET /sse` event stream;
//! client-to-server frames are POSTed to a per-session endpoint the server
//! advertises as the first SSE event (`event: endpoint`). Per the SSE
//! specification, a `data:` event with no `event:` line is the default
//! `message` event.
//!
//! The client reconnects with exponential backoff on transient network
//! failure. The only resumption signal the wire offers is the re-advertised
//! endpoint: when it matches the previous one the session is resumed and
//! in-flight requests are kept, otherwise the transport turns fatal and
//! they fail.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::codec::Frame;
use crate::error::{Error, JsonRpcError, Result};
use crate::server::{Server, ServerConnection};
use crate::transport::{
    closed_channel, CloseCause, ClosedNotifier, ClosedSignal, FrameReceiver, FrameSender,
    Transport, DEFAULT_SEND_BUFFER,
};

/// Default event-stream path.
pub const DEFAULT_SSE_PATH: &str = "/sse";

/// Default client-to-server POST path.
pub const DEFAULT_POST_PATH: &str = "/message";

// ============================================================================
// SSE wire format
// ============================================================================

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    /// Event type; `message` when the stream omits the `event:` field.
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Push raw chunks in, get complete events out;
/// partial lines and partial events are buffered across pushes.
#[derive(Default)]
pub(crate) struct SseDecoder {
    partial_line: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut text = std::mem::take(&mut self.partial_line);
        text.push_str(chunk);

        let mut rest = text.as_str();
        while let Some(newline) = rest.find('\n') {
            let line = rest[..newline].trim_end_matches('\r');
            rest = &rest[newline + 1..];
            self.feed_line(line, &mut events);
        }
        self.partial_line = rest.to_string();
        events
    }

    fn feed_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(SseEvent {
                    event: self
                        .event_type
                        .take()
                        .unwrap_or_else(|| "message".to_string()),
                    data: self.data_lines.join("\n"),
                });
                self.data_lines.clear();
            } else {
                self.event_type = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event_type = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        // id: and retry: fields are not used by this transport.
    }
}

// ============================================================================
// Client transport
// ============================================================================

/// Reconnect backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Consecutive failed attempts before the transport turns fatal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial.mul_f64(factor);
        delay.min(self.max)
    }
}

/// Client side of the SSE transport.
pub struct SseClientTransport {
    base_url: Url,
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    reconnect: ReconnectPolicy,

    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: Option<mpsc::Receiver<Frame>>,
    inbound_rx: Option<FrameReceiver>,
    closed: Arc<ClosedNotifier>,
    started: bool,
}

impl SseClientTransport {
    /// `base_url` is the server root; the event stream is opened at
    /// `{base_url}/sse`.
    pub fn new(base_url: Url) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);
        Self {
            base_url,
            http: reqwest::Client::new(),
            headers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_rx: None,
            closed: Arc::new(closed_channel()),
            started: false,
        }
    }

    /// Use a preconfigured HTTP client (proxies, TLS, timeouts).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Add a header to every request (auth is a pass-through concern).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    fn sse_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/sse",
            url.path().trim_end_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| Error::Internal("sse transport already consumed".into()))?;
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);
        let (endpoint_tx, endpoint_rx) = watch::channel::<Option<Url>>(None);

        tokio::spawn(sse_reader(
            self.http.clone(),
            self.sse_url()?,
            self.base_url.clone(),
            self.headers.clone(),
            self.reconnect.clone(),
            inbound_tx,
            endpoint_tx,
            self.closed.clone(),
        ));
        tokio::spawn(sse_writer(
            self.http.clone(),
            self.headers.clone(),
            outbound_rx,
            endpoint_rx,
            self.closed.clone(),
        ));

        self.inbound_rx = Some(inbound_rx);
        self.started = true;
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

/// Reader task: long-lived GET on `/sse`, reconnecting with backoff.
#[allow(clippy::too_many_arguments)]
async fn sse_reader(
    http: reqwest::Client,
    sse_url: Url,
    base_url: Url,
    headers: Vec<(String, String)>,
    policy: ReconnectPolicy,
    inbound: mpsc::Sender<Frame>,
    endpoint_tx: watch::Sender<Option<Url>>,
    closed: Arc<ClosedNotifier>,
) {
    let signal = closed.subscribe();
    let mut attempts: u32 = 0;

    'reconnect: loop {
        if signal.is_closed() {
            return;
        }

        let mut request = http
            .get(sse_url.clone())
            .header("accept", "text/event-stream");
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                attempts = 0;
                let mut decoder = SseDecoder::new();
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    if signal.is_closed() {
                        return;
                    }
                    let chunk = match chunk {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(error = %e, "sse stream interrupted");
                            break;
                        }
                    };
                    for event in decoder.push(&String::from_utf8_lossy(&chunk)) {
                        match event.event.as_str() {
                            "endpoint" => {
                                let endpoint = match base_url.join(event.data.trim()) {
                                    Ok(url) => url,
                                    Err(e) => {
                                        closed.notify(CloseCause::Fatal(format!(
                                            "bad endpoint event: {}",
                                            e
                                        )));
                                        return;
                                    }
                                };
                                let previous = endpoint_tx.borrow().clone();
                                if let Some(previous) = previous {
                                    if previous != endpoint {
                                        // New session on the server side; our
                                        // in-flight requests cannot be resumed.
                                        closed.notify(CloseCause::Fatal(
                                            "server session not resumed after reconnect".into(),
                                        ));
                                        return;
                                    }
                                } else {
                                    let _ = endpoint_tx.send(Some(endpoint));
                                }
                            }
                            "message" => match Frame::decode(&event.data) {
                                Ok(frame) => {
                                    if inbound.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping malformed sse frame");
                                }
                            },
                            other => {
                                tracing::debug!(event = %other, "ignoring sse event type");
                            }
                        }
                    }
                }
                // Stream ended; fall through to reconnect.
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "sse connect rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "sse connect failed");
            }
        }

        attempts += 1;
        if attempts > policy.max_attempts {
            closed.notify(CloseCause::Fatal("sse reconnect attempts exhausted".into()));
            return;
        }
        let delay = policy.delay(attempts);
        tracing::debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "sse reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => continue 'reconnect,
            _ = signal.wait() => return,
        }
    }
}

/// Writer task: POST outbound frames to the advertised endpoint.
async fn sse_writer(
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    mut outbound: mpsc::Receiver<Frame>,
    mut endpoint_rx: watch::Receiver<Option<Url>>,
    closed: Arc<ClosedNotifier>,
) {
    // No frame may be posted before the server advertises the endpoint.
    let endpoint = loop {
        if let Some(url) = endpoint_rx.borrow_and_update().clone() {
            break url;
        }
        if endpoint_rx.changed().await.is_err() {
            return;
        }
    };

    let signal = closed.subscribe();
    loop {
        let frame = tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(frame) => frame,
                None => return,
            },
            _ = signal.wait() => return,
        };

        let body = match frame.encode() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outbound frame");
                continue;
            }
        };

        let mut request = http
            .post(endpoint.clone())
            .header("content-type", "application/json")
            .body(body);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(status = %response.status(), "sse post rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "sse post failed");
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Configuration for [`SseServer`].
#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub sse_path: String,
    pub post_path: String,
    /// Origins accepted on incoming requests; empty allows all.
    pub allowed_origins: Vec<String>,
    /// Keep-alive comment interval on the event stream.
    pub heartbeat: Duration,
    /// Maximum concurrent event streams.
    pub max_connections: usize,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            sse_path: DEFAULT_SSE_PATH.to_string(),
            post_path: DEFAULT_POST_PATH.to_string(),
            allowed_origins: Vec::new(),
            heartbeat: Duration::from_secs(30),
            max_connections: 256,
        }
    }
}

struct SseServerState {
    server: Server,
    config: SseServerConfig,
    connections: RwLock<HashMap<String, SseConnection>>,
}

struct SseConnection {
    connection: ServerConnection,
    frames: mpsc::Sender<Frame>,
}

/// SSE server front-end for a [`Server`] engine.
pub struct SseServer {
    state: Arc<SseServerState>,
}

impl SseServer {
    pub fn new(server: Server) -> Self {
        Self::with_config(server, SseServerConfig::default())
    }

    pub fn with_config(server: Server, config: SseServerConfig) -> Self {
        Self {
            state: Arc::new(SseServerState {
                server,
                config,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The axum router, for mounting into an existing application.
    pub fn router(&self) -> Router {
        let config = &self.state.config;
        Router::new()
            .route(&config.sse_path, get(sse_stream))
            .route(&config.post_path, post(sse_post))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, "sse server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Transport(format!("sse server: {e}")))
    }
}

fn origin_allowed(state: &SseServerState, headers: &HeaderMap) -> bool {
    if state.config.allowed_origins.is_empty() {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => state
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin),
        // Non-browser clients send no Origin header.
        None => true,
    }
}

/// Removes the connection record when the event stream drops.
struct StreamGuard {
    key: String,
    state: Arc<SseServerState>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let removed = self
            .state
            .connections
            .write()
            .expect("sse connection lock poisoned")
            .remove(&self.key);
        if let Some(entry) = removed {
            entry.connection.teardown();
            tracing::debug!(key = %self.key, "sse connection closed");
        }
    }
}

async fn sse_stream(
    State(state): State<Arc<SseServerState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !origin_allowed(&state, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    {
        let connections = state
            .connections
            .read()
            .expect("sse connection lock poisoned");
        if connections.len() >= state.config.max_connections {
            return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached")
                .into_response();
        }
    }

    let key = uuid::Uuid::new_v4().to_string();
    let (frames_tx, frames_rx) = mpsc::channel::<Frame>(DEFAULT_SEND_BUFFER);
    let connection = state
        .server
        .connection_with_outbound(FrameSender::new(frames_tx.clone()));

    state
        .connections
        .write()
        .expect("sse connection lock poisoned")
        .insert(
            key.clone(),
            SseConnection {
                connection,
                frames: frames_tx,
            },
        );
    tracing::debug!(key = %key, "sse connection opened");

    let endpoint = format!("{}?sessionId={}", state.config.post_path, key);
    let guard = StreamGuard {
        key,
        state: state.clone(),
    };

    let first = futures::stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let frames = ReceiverStream::new(frames_rx).map(move |frame| {
        // The guard lives as long as the stream does.
        let _ = &guard;
        let data = frame.encode().unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().event("message").data(data))
    });

    let heartbeat = state.config.heartbeat;
    Sse::new(first.chain(frames))
        .keep_alive(KeepAlive::new().interval(heartbeat))
        .into_response()
}

#[derive(serde::Deserialize)]
struct PostQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn sse_post(
    State(state): State<Arc<SseServerState>>,
    Query(query): Query<PostQuery>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    if !origin_allowed(&state, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let entry = {
        let connections = state
            .connections
            .read()
            .expect("sse connection lock poisoned");
        connections
            .get(&query.session_id)
            .map(|e| (e.connection.clone(), e.frames.clone()))
    };
    let Some((connection, frames)) = entry else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let frame = match Frame::decode(&body) {
        Ok(frame) => frame,
        Err(e) => {
            let error = match e {
                Error::JsonRpc(rpc) => rpc,
                other => JsonRpcError::parse_error(other.to_string()),
            };
            let reply = Frame::Response(crate::protocol::JsonRpcResponse::error(None, error));
            let _ = frames.send(reply).await;
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Responses are delivered on the event stream; the POST just accepts.
    tokio::spawn(async move {
        if let Some(response) = connection.handle(frame).await {
            let _ = frames.send(response).await;
        }
    });

    StatusCode::ACCEPTED.into_response()
}
