//! Streamable HTTP transport for MCP
//!
//! The client POSTs each JSON-RPC frame to a single endpoint (default
//! `/mcp`). The server's reply is one of:
//!
//! - a single `application/json` document (immediate reply),
//! - a `text/event-stream` body carrying zero or more notifications
//!   followed by the terminal response,
//! - `202 Accepted` with no body (for notifications).
//!
//! The first successful initialize response carries an `Mcp-Session-Id`
//! header which the client echoes on every subsequent request. Absence or
//! mismatch yields HTTP 404, surfaced to callers as `SessionLost`; the
//! client must reinitialize.
//!
//! The client also opens a standalone `GET` event stream for
//! server-initiated notifications when the server supports it (a 405 is
//! tolerated); `DELETE` tears the session down.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::codec::Frame;
use crate::context::NotificationReceiver;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{JsonRpcResponse, LATEST_PROTOCOL_VERSION};
use crate::server::{Server, ServerConnection};
use crate::transport::sse::SseDecoder;
use crate::transport::{
    closed_channel, CloseCause, ClosedNotifier, ClosedSignal, FrameReceiver, FrameSender,
    Transport, DEFAULT_SEND_BUFFER,
};

/// Session id header, set by the server on initialize and echoed by the
/// client afterwards.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Protocol version header sent on every client request.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Default endpoint path.
pub const DEFAULT_ENDPOINT_PATH: &str = "/mcp";

// ============================================================================
// Client transport
// ============================================================================

/// Client side of the streamable HTTP transport.
pub struct StreamableHttpTransport {
    endpoint: Url,
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    open_get_stream: bool,

    session: Arc<RwLock<Option<String>>>,
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: Option<mpsc::Receiver<Frame>>,
    inbound_rx: Option<FrameReceiver>,
    closed: Arc<ClosedNotifier>,
    started: bool,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: Url) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);
        Self {
            endpoint,
            http: reqwest::Client::new(),
            headers: Vec::new(),
            open_get_stream: true,
            session: Arc::new(RwLock::new(None)),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_rx: None,
            closed: Arc::new(closed_channel()),
            started: false,
        }
    }

    /// Use a preconfigured HTTP client.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Add a header to every request (auth is a pass-through concern).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Do not open the standalone GET notification stream.
    pub fn without_get_stream(mut self) -> Self {
        self.open_get_stream = false;
        self
    }

    /// The session id issued by the server, once initialize has completed.
    pub fn session_id(&self) -> Option<String> {
        self.session.read().expect("session lock poisoned").clone()
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| Error::Internal("http transport already consumed".into()))?;
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_SEND_BUFFER);

        tokio::spawn(post_loop(PostLoop {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            session: self.session.clone(),
            open_get_stream: self.open_get_stream,
            inbound: inbound_tx,
            closed: self.closed.clone(),
        }, outbound_rx));

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
        // Best-effort DELETE so the server can reap the session.
        if let Some(session_id) = self.session_id() {
            let mut request = self.http.delete(self.endpoint.clone());
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
            for (name, value) in &self.headers {
                request = request.header(name, value);
            }
            let _ = request.send().await;
        }
        self.closed.notify(CloseCause::Closed);
        Ok(())
    }
}

struct PostLoop {
    http: reqwest::Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
    session: Arc<RwLock<Option<String>>>,
    open_get_stream: bool,
    inbound: mpsc::Sender<Frame>,
    closed: Arc<ClosedNotifier>,
}

impl PostLoop {
    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .header(MCP_PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION);
        if let Some(session_id) = self.session.read().expect("session lock poisoned").clone() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }
}

/// Writer loop: POST each outbound frame and feed whatever comes back into
/// the inbound channel. The correlator disentangles multiplexed responses.
async fn post_loop(ctx: PostLoop, mut outbound: mpsc::Receiver<Frame>) {
    let signal = ctx.closed.subscribe();
    let mut get_stream_started = false;

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

        let request = ctx.apply_headers(ctx.http.post(ctx.endpoint.clone())).body(body);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // The request will fail by timeout at the correlator.
                tracing::warn!(error = %e, "http post failed");
                continue;
            }
        };

        if response.status() == StatusCode::NOT_FOUND {
            ctx.closed.notify(CloseCause::SessionLost);
            return;
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = ctx.session.write().expect("session lock poisoned");
            if slot.as_deref() != Some(session_id) {
                *slot = Some(session_id.to_string());
            }
        }
        if ctx.open_get_stream
            && !get_stream_started
            && ctx.session.read().expect("session lock poisoned").is_some()
        {
            get_stream_started = true;
            tokio::spawn(get_stream_loop(
                ctx.http.clone(),
                ctx.endpoint.clone(),
                ctx.headers.clone(),
                ctx.session.clone(),
                ctx.inbound.clone(),
                ctx.closed.clone(),
            ));
        }

        // 202 Accepted with no body: valid for notifications, delivers
        // nothing to the correlator.
        if response.status() == StatusCode::ACCEPTED {
            continue;
        }
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "http post rejected");
            continue;
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Drain on a separate task so a long-streaming reply does not
            // head-of-line block subsequent posts.
            let inbound = ctx.inbound.clone();
            tokio::spawn(async move {
                drain_event_stream(response, inbound).await;
            });
        } else {
            match response.text().await {
                Ok(text) if !text.trim().is_empty() => match Frame::decode(text.trim()) {
                    Ok(frame) => {
                        if ctx.inbound.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed http reply"),
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to read http reply"),
            }
        }
    }
}

/// Forward every SSE `data:` payload in a response body as an inbound
/// frame, in order.
async fn drain_event_stream(response: reqwest::Response, inbound: mpsc::Sender<Frame>) {
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "event-stream reply interrupted");
                return;
            }
        };
        for event in decoder.push(&String::from_utf8_lossy(&chunk)) {
            match Frame::decode(&event.data) {
                Ok(frame) => {
                    if inbound.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping malformed event-stream frame"),
            }
        }
    }
}

/// Standalone notification stream: GET the endpoint and forward events.
/// A 405 means the server does not offer one; reopened on transient errors.
async fn get_stream_loop(
    http: reqwest::Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
    session: Arc<RwLock<Option<String>>>,
    inbound: mpsc::Sender<Frame>,
    closed: Arc<ClosedNotifier>,
) {
    let signal = closed.subscribe();
    loop {
        if signal.is_closed() {
            return;
        }
        let mut request = http
            .get(endpoint.clone())
            .header("accept", "text/event-stream")
            .header(MCP_PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION);
        if let Some(session_id) = session.read().expect("session lock poisoned").clone() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                drain_event_stream(response, inbound.clone()).await;
            }
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                closed.notify(CloseCause::SessionLost);
                return;
            }
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::debug!("server offers no standalone notification stream");
                return;
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "notification stream rejected");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "notification stream connect failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = signal.wait() => return,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Configuration for [`StreamableHttpServer`].
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// Endpoint path, default `/mcp`.
    pub path: String,
    /// Origins accepted on incoming requests; empty allows all.
    pub allowed_origins: Vec<String>,
    /// Keep-alive interval on event streams.
    pub heartbeat: Duration,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ENDPOINT_PATH.to_string(),
            allowed_origins: Vec::new(),
            heartbeat: Duration::from_secs(30),
        }
    }
}

type MailboxSlot = Arc<Mutex<Option<NotificationReceiver>>>;

struct HttpEntry {
    connection: ServerConnection,
    mailbox: MailboxSlot,
}

struct HttpServerState {
    server: Server,
    config: StreamableHttpConfig,
    sessions: RwLock<HashMap<String, HttpEntry>>,
}

/// Single-endpoint streamable HTTP front-end for a [`Server`] engine.
pub struct StreamableHttpServer {
    state: Arc<HttpServerState>,
}

impl StreamableHttpServer {
    pub fn new(server: Server) -> Self {
        Self::with_config(server, StreamableHttpConfig::default())
    }

    pub fn with_config(server: Server, config: StreamableHttpConfig) -> Self {
        Self {
            state: Arc::new(HttpServerState {
                server,
                config,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The axum router, for mounting into an existing application.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.path, any(mcp_endpoint))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, "streamable http server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Transport(format!("streamable http server: {e}")))
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

fn origin_allowed(state: &HttpServerState, headers: &HeaderMap) -> bool {
    if state.config.allowed_origins.is_empty() {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => state
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin),
        None => true,
    }
}

async fn mcp_endpoint(
    State(state): State<Arc<HttpServerState>>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    if !origin_allowed(&state, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    if method == axum::http::Method::POST {
        handle_post(state, headers, body).await
    } else if method == axum::http::Method::GET {
        handle_get(state, headers).await
    } else if method == axum::http::Method::DELETE {
        handle_delete(state, headers).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn handle_post(
    state: Arc<HttpServerState>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let frame = match Frame::decode(&body) {
        Ok(frame) => frame,
        Err(e) => {
            let error = match e {
                Error::JsonRpc(rpc) => rpc,
                other => JsonRpcError::parse_error(other.to_string()),
            };
            let reply = Frame::Response(JsonRpcResponse::error(None, error));
            return (
                StatusCode::BAD_REQUEST,
                [("content-type", "application/json")],
                reply.encode().unwrap_or_default(),
            )
                .into_response();
        }
    };

    if is_initialize(&frame) {
        return handle_initialize_post(state, frame).await;
    }

    // Every non-initialize frame needs a live session id.
    let entry = session_header(&headers).and_then(|id| {
        let sessions = state.sessions.read().expect("http session lock poisoned");
        sessions
            .get(&id)
            .map(|e| (e.connection.clone(), e.mailbox.clone()))
    });
    let Some((connection, mailbox)) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match frame {
        Frame::Notification(_) | Frame::Response(_) => {
            let _ = connection.handle(frame).await;
            StatusCode::ACCEPTED.into_response()
        }
        frame => {
            let streamed = accepts_event_stream(&headers)
                .then(|| mailbox.lock().expect("mailbox lock poisoned").take())
                .flatten();
            match streamed {
                Some(receiver) => {
                    streamed_response(state.config.heartbeat, connection, frame, receiver, mailbox)
                        .await
                }
                None => json_response(connection, frame).await,
            }
        }
    }
}

fn is_initialize(frame: &Frame) -> bool {
    matches!(frame, Frame::Request(r) if r.method == crate::protocol::methods::INITIALIZE)
}

async fn handle_initialize_post(
    state: Arc<HttpServerState>,
    frame: Frame,
) -> axum::response::Response {
    let connection = state.server.connection();
    let response = connection.handle(frame).await;

    let body = response
        .as_ref()
        .and_then(|f| f.encode().ok())
        .unwrap_or_default();

    match connection.session() {
        Some(session) => {
            let session_id = session.id().to_string();
            let mailbox = Arc::new(Mutex::new(connection.take_mailbox()));
            state
                .sessions
                .write()
                .expect("http session lock poisoned")
                .insert(
                    session_id.clone(),
                    HttpEntry {
                        connection,
                        mailbox,
                    },
                );
            (
                StatusCode::OK,
                [
                    ("content-type", "application/json".to_string()),
                    (MCP_SESSION_ID_HEADER, session_id),
                ],
                body,
            )
                .into_response()
        }
        // Initialize failed; answer with the error document, no session.
        None => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
    }
}

async fn json_response(connection: ServerConnection, frame: Frame) -> axum::response::Response {
    match connection.handle(frame).await {
        Some(response) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            response.encode().unwrap_or_default(),
        )
            .into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Reply with an event stream: session notifications while the handler
/// runs, then the terminal response. The mailbox receiver is returned to
/// its slot when the stream finishes.
async fn streamed_response(
    heartbeat: Duration,
    connection: ServerConnection,
    frame: Frame,
    mut receiver: NotificationReceiver,
    slot: MailboxSlot,
) -> axum::response::Response {
    let (event_tx, event_rx) = mpsc::channel::<String>(DEFAULT_SEND_BUFFER);

    tokio::spawn(async move {
        let handle = connection.handle(frame);
        tokio::pin!(handle);
        loop {
            tokio::select! {
                maybe = receiver.recv() => {
                    if let Some(notification) = maybe {
                        let data = Frame::Notification(notification)
                            .encode()
                            .unwrap_or_default();
                        if event_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                }
                response = &mut handle => {
                    if let Some(response) = response {
                        let _ = event_tx.send(response.encode().unwrap_or_default()).await;
                    }
                    break;
                }
            }
        }
        *slot.lock().expect("mailbox lock poisoned") = Some(receiver);
    });

    let stream = ReceiverStream::new(event_rx)
        .map(|data| Ok::<Event, Infallible>(Event::default().event("message").data(data)));
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat))
        .into_response()
}

async fn handle_get(state: Arc<HttpServerState>, headers: HeaderMap) -> axum::response::Response {
    let entry = session_header(&headers).and_then(|id| {
        let sessions = state.sessions.read().expect("http session lock poisoned");
        sessions.get(&id).map(|e| e.mailbox.clone())
    });
    let Some(slot) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let receiver = slot.lock().expect("mailbox lock poisoned").take();
    let Some(receiver) = receiver else {
        // Another stream already holds the mailbox.
        return StatusCode::CONFLICT.into_response();
    };

    let stream = MailboxStream {
        receiver: Some(receiver),
        slot,
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.config.heartbeat))
        .into_response()
}

async fn handle_delete(
    state: Arc<HttpServerState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let removed = session_header(&headers).and_then(|id| {
        state
            .sessions
            .write()
            .expect("http session lock poisoned")
            .remove(&id)
    });
    match removed {
        Some(entry) => {
            entry.connection.teardown();
            StatusCode::OK.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Streams a session mailbox as SSE events, giving the receiver back to the
/// slot when the client disconnects.
struct MailboxStream {
    receiver: Option<NotificationReceiver>,
    slot: MailboxSlot,
}

impl futures::Stream for MailboxStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(None);
        };
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(notification)) => {
                let data = Frame::Notification(notification).encode().unwrap_or_default();
                Poll::Ready(Some(Ok(Event::default().event("message").data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MailboxStream {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            *self.slot.lock().expect("mailbox lock poisoned") = Some(receiver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientBuilder;
    use crate::protocol::CallToolResult;
    use crate::tool::Tool;
    use std::net::SocketAddr;

    fn echo_server() -> Server {
        Server::builder()
            .server_info("http-test-server", "0.0.1")
            .tool(
                Tool::builder("echo").handler(|args: serde_json::Value, _ctx| async move {
                    let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                    Ok(CallToolResult::text(message))
                }),
            )
            .build()
    }

    async fn spawn_http(server: Server) -> SocketAddr {
        let http = StreamableHttpServer::new(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = http.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn endpoint(addr: SocketAddr) -> Url {
        Url::parse(&format!("http://{addr}/mcp")).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_issues_session_and_echo_works() {
        let addr = spawn_http(echo_server()).await;
        let transport = StreamableHttpTransport::new(endpoint(addr)).without_get_stream();

        let client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_secs(5))
            .connect(transport)
            .await
            .unwrap();

        let info = client.initialize().await.unwrap();
        assert_eq!(info.server_info.name, "http-test-server");

        let result = client
            .call_tool("echo", serde_json::json!({"message": "hi"}))
            .await
            .unwrap();
        match &result.content[0] {
            crate::protocol::Content::Text { text } => assert_eq!(text, "hi"),
            other => panic!("expected text, got {other:?}"),
        }
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_session_is_404() {
        let addr = spawn_http(echo_server()).await;
        let http = reqwest::Client::new();

        let response = http
            .post(endpoint(addr))
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_gets_202_no_body() {
        let addr = spawn_http(echo_server()).await;
        let http = reqwest::Client::new();

        // Initialize first to obtain a session id.
        let response = http
            .post(endpoint(addr))
            .header("content-type", "application/json")
            .body(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"raw","version":"0"}}}"#,
            )
            .send()
            .await
            .unwrap();
        let session_id = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let response = http
            .post(endpoint(addr))
            .header("content-type", "application/json")
            .header(MCP_SESSION_ID_HEADER, &session_id)
            .body(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        assert!(response.text().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_loss_surfaces_and_reinitialize_recovers() {
        let engine = echo_server();
        let addr = spawn_http(engine.clone()).await;

        let transport = StreamableHttpTransport::new(endpoint(addr)).without_get_stream();
        let client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_secs(5))
            .connect(transport)
            .await
            .unwrap();
        client.initialize().await.unwrap();
        client.ping().await.unwrap();

        // Simulate a server restart: forget every session.
        for session in engine.sessions().all() {
            engine.sessions().unregister(session.id());
        }
        let addr2 = spawn_http(engine.clone()).await;

        // Old session id against a fresh server: 404 -> SessionLost.
        let stale = StreamableHttpTransport::new(endpoint(addr2)).without_get_stream();
        *stale.session.write().unwrap() = Some("stale-id".to_string());
        let stale_client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_secs(5))
            .connect(stale)
            .await
            .unwrap();
        let err = stale_client.ping().await.unwrap_err();
        assert!(matches!(err, Error::SessionLost | Error::TransportClosed));

        // Reinitializing on a fresh transport recovers.
        let fresh = StreamableHttpTransport::new(endpoint(addr2)).without_get_stream();
        let fresh_client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_secs(5))
            .connect(fresh)
            .await
            .unwrap();
        fresh_client.initialize().await.unwrap();
        fresh_client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_error_is_400_with_error_body() {
        let addr = spawn_http(echo_server()).await;
        let http = reqwest::Client::new();

        let response = http
            .post(endpoint(addr))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32700);
    }
}
