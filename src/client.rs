//! MCP client engine
//!
//! Drives the initialize handshake and exposes typed operations over a
//! [`Transport`]. Server-initiated traffic (notifications and requests) is
//! delivered to a [`ClientHandler`] in receive order.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_conduit::client::ClientBuilder;
//! use mcp_conduit::transport::stdio::ChildProcessTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = ChildProcessTransport::new("my-mcp-server").arg("--flag");
//!     let client = ClientBuilder::new("my-client", "1.0.0")
//!         .connect(transport)
//!         .await?;
//!
//!     let info = client.initialize().await?;
//!     println!("connected to {}", info.server_info.name);
//!
//!     let tools = client.list_tools(None).await?;
//!     for tool in &tools.tools {
//!         println!("tool: {}", tool.name);
//!     }
//!
//!     let result = client
//!         .call_tool("echo", serde_json::json!({"message": "hi"}))
//!         .await?;
//!     println!("{result:?}");
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::Frame;
use crate::correlator::{Correlator, RequestOptions, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{
    methods, notifications, CallToolParams, CallToolResult, CancelledParams, ClientCapabilities,
    CompleteParams, CompleteResult, CompletionArgument, CompletionReference, GetPromptParams,
    GetPromptResult, Implementation, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListPromptsParams, ListPromptsResult,
    ListResourceTemplatesParams, ListResourceTemplatesResult, ListResourcesParams,
    ListResourcesResult, ListToolsParams, ListToolsResult, LogLevel, LoggingMessageParams,
    ProgressParams, ReadResourceParams, ReadResourceResult, RequestId, ResourceUpdatedParams,
    SetLevelParams, SubscribeParams, UnsubscribeParams, LATEST_PROTOCOL_VERSION,
};
use crate::session::PhaseState;
use crate::transport::{FrameSender, Transport};

/// Receives server-initiated traffic. Every method has a no-op default;
/// implement only what you care about. Delivery is sequential in receive
/// order per connection.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn on_progress(&self, params: ProgressParams) {
        let _ = params;
    }

    /// `notifications/message` log records.
    async fn on_log_message(&self, params: LoggingMessageParams) {
        let _ = params;
    }

    async fn on_resource_updated(&self, params: ResourceUpdatedParams) {
        let _ = params;
    }

    async fn on_resource_list_changed(&self) {}

    async fn on_tool_list_changed(&self) {}

    async fn on_prompt_list_changed(&self) {}

    async fn on_cancelled(&self, params: CancelledParams) {
        let _ = params;
    }

    /// Server-initiated request (e.g. sampling). The default declines with
    /// MethodNotFound.
    async fn on_request(&self, request: JsonRpcRequest) -> Result<Value> {
        Err(Error::JsonRpc(
            crate::error::JsonRpcError::method_not_found(&request.method),
        ))
    }
}

/// Handler that ignores everything.
pub struct NoopHandler;

#[async_trait]
impl ClientHandler for NoopHandler {}

struct ClientInner {
    correlator: Correlator,
    phase: PhaseState,
    server_info: RwLock<Option<InitializeResult>>,
    info: Implementation,
    capabilities: ClientCapabilities,
    next_id: AtomicI64,
}

impl ClientInner {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Handshake gate: everything except `initialize` and `ping` fails
    /// locally before the handshake completes. No wire traffic.
    fn ensure_ready(&self) -> Result<()> {
        if self.phase.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

/// MCP client handle. Cloneable; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    transport: Arc<tokio::sync::Mutex<Box<dyn Transport>>>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    info: Implementation,
    capabilities: ClientCapabilities,
    handler: Arc<dyn ClientHandler>,
    request_timeout: Duration,
}

impl ClientBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            capabilities: ClientCapabilities::default(),
            handler: Arc::new(NoopHandler),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Capability flags to advertise during the handshake.
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Handler for server-initiated notifications and requests.
    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: ClientHandler + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Default per-request deadline (30s unless overridden).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Start the transport and spawn the dispatch loop.
    pub async fn connect<T>(self, mut transport: T) -> Result<Client>
    where
        T: Transport + 'static,
    {
        transport.start().await?;
        let sender = transport.sender();
        let incoming = transport
            .incoming()
            .ok_or_else(|| Error::Internal("transport incoming stream already taken".into()))?;
        let closed = transport.closed();

        let correlator = Correlator::new(sender.clone(), closed.clone(), self.request_timeout);

        let inner = Arc::new(ClientInner {
            correlator: correlator.clone(),
            phase: PhaseState::new(),
            server_info: RwLock::new(None),
            info: self.info,
            capabilities: self.capabilities,
            next_id: AtomicI64::new(1),
        });

        tokio::spawn(dispatch_loop(
            incoming,
            closed,
            correlator,
            self.handler,
            sender,
        ));

        Ok(Client {
            inner,
            transport: Arc::new(tokio::sync::Mutex::new(Box::new(transport))),
        })
    }
}

async fn dispatch_loop(
    mut incoming: crate::transport::FrameReceiver,
    closed: crate::transport::ClosedSignal,
    correlator: Correlator,
    handler: Arc<dyn ClientHandler>,
    sender: FrameSender,
) {
    loop {
        tokio::select! {
            maybe = incoming.recv() => match maybe {
                Some(frame) => dispatch_frame(frame, &correlator, &handler, &sender).await,
                None => break,
            },
            _ = closed.wait() => break,
        }
    }
    // The connection is gone: every awaiting request fails now.
    correlator.fail_all();
    tracing::debug!("client dispatch loop ended");
}

async fn dispatch_frame(
    frame: Frame,
    correlator: &Correlator,
    handler: &Arc<dyn ClientHandler>,
    sender: &FrameSender,
) {
    match frame {
        Frame::Batch(frames) => {
            // Elements are delivered independently, in receive order; the
            // codec guarantees they are not themselves batches.
            for frame in frames {
                dispatch_single(frame, correlator, handler, sender).await;
            }
        }
        frame => dispatch_single(frame, correlator, handler, sender).await,
    }
}

async fn dispatch_single(
    frame: Frame,
    correlator: &Correlator,
    handler: &Arc<dyn ClientHandler>,
    sender: &FrameSender,
) {
    match frame {
        Frame::Response(response) => {
            correlator.resolve(response);
        }
        Frame::Notification(notification) => {
            dispatch_notification(notification, handler).await;
        }
        Frame::Request(request) => {
            let id = request.id.clone();
            let response = match handler.on_request(request).await {
                Ok(result) => JsonRpcResponse::result(id, result),
                Err(error) => JsonRpcResponse::error(Some(id), error.to_json_rpc()),
            };
            if let Err(e) = sender.send(Frame::Response(response)) {
                tracing::debug!(error = %e, "reply to server request not sent");
            }
        }
        Frame::Batch(_) => {
            tracing::debug!("dropping nested batch frame");
        }
    }
}

async fn dispatch_notification(
    notification: JsonRpcNotification,
    handler: &Arc<dyn ClientHandler>,
) {
    let method = notification.method.as_str();
    let params = notification.params.clone();

    // Decode typed params or bail out with a debug log.
    macro_rules! typed {
        ($ty:ty) => {
            match params.and_then(|p| serde_json::from_value::<$ty>(p).ok()) {
                Some(p) => p,
                None => {
                    tracing::debug!(method = %method, "dropping malformed notification");
                    return;
                }
            }
        };
    }

    match method {
        notifications::PROGRESS => handler.on_progress(typed!(ProgressParams)).await,
        notifications::MESSAGE => handler.on_log_message(typed!(LoggingMessageParams)).await,
        notifications::RESOURCE_UPDATED => {
            handler
                .on_resource_updated(typed!(ResourceUpdatedParams))
                .await
        }
        notifications::RESOURCES_LIST_CHANGED => handler.on_resource_list_changed().await,
        notifications::TOOLS_LIST_CHANGED => handler.on_tool_list_changed().await,
        notifications::PROMPTS_LIST_CHANGED => handler.on_prompt_list_changed().await,
        notifications::CANCELLED | notifications::CANCELLED_ALIAS => {
            handler.on_cancelled(typed!(CancelledParams)).await
        }
        other => {
            tracing::debug!(method = %other, "ignoring unknown notification");
        }
    }
}

impl Client {
    /// The initialize result, available after the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner
            .server_info
            .read()
            .expect("client lock poisoned")
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.phase.is_initialized()
    }

    /// Perform the initialize handshake: send our version and capabilities,
    /// accept the server's reply, and emit `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.capabilities.clone(),
            client_info: self.inner.info.clone(),
        };

        let result: InitializeResult = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?), &RequestOptions::default())
            .await?;

        self.inner.phase.mark_initializing();
        *self
            .inner
            .server_info
            .write()
            .expect("client lock poisoned") = Some(result.clone());

        self.inner
            .correlator
            .notify(JsonRpcNotification::new(notifications::INITIALIZED))?;
        self.inner.phase.mark_initialized();

        Ok(result)
    }

    /// Keepalive; allowed before the handshake completes.
    pub async fn ping(&self) -> Result<()> {
        let _: Value = self
            .request(methods::PING, Some(serde_json::json!({})), &RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.inner.ensure_ready()?;
        let params = ListToolsParams { cursor };
        self.request(
            methods::TOOLS_LIST,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.call_tool_with_options(name, arguments, RequestOptions::default())
            .await
    }

    /// `tools/call` with an explicit timeout, cancellation token, or
    /// progress token.
    pub async fn call_tool_with_options(
        &self,
        name: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> Result<CallToolResult> {
        self.inner.ensure_ready()?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        self.request(
            methods::TOOLS_CALL,
            Some(serde_json::to_value(&params)?),
            &options,
        )
        .await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.inner.ensure_ready()?;
        let params = ListResourcesParams { cursor };
        self.request(
            methods::RESOURCES_LIST,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.inner.ensure_ready()?;
        let params = ListResourceTemplatesParams { cursor };
        self.request(
            methods::RESOURCES_TEMPLATES_LIST,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.inner.ensure_ready()?;
        let params = ReadResourceParams { uri: uri.into() };
        self.request(
            methods::RESOURCES_READ,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    /// Subscribe to change notifications for a resource URI. Idempotent on
    /// the server side.
    pub async fn subscribe(&self, uri: &str) -> Result<()> {
        self.inner.ensure_ready()?;
        let params = SubscribeParams { uri: uri.into() };
        let _: Value = self
            .request(
                methods::RESOURCES_SUBSCRIBE,
                Some(serde_json::to_value(&params)?),
                &RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, uri: &str) -> Result<()> {
        self.inner.ensure_ready()?;
        let params = UnsubscribeParams { uri: uri.into() };
        let _: Value = self
            .request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(serde_json::to_value(&params)?),
                &RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.inner.ensure_ready()?;
        let params = ListPromptsParams { cursor };
        self.request(
            methods::PROMPTS_LIST,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.inner.ensure_ready()?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(
            methods::PROMPTS_GET,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    pub async fn set_logging_level(&self, level: LogLevel) -> Result<()> {
        self.inner.ensure_ready()?;
        let params = SetLevelParams { level };
        let _: Value = self
            .request(
                methods::LOGGING_SET_LEVEL,
                Some(serde_json::to_value(&params)?),
                &RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// Ask the server for completion suggestions for a prompt argument or
    /// resource URI.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument_name: &str,
        argument_value: &str,
    ) -> Result<CompleteResult> {
        self.inner.ensure_ready()?;
        let params = CompleteParams {
            reference,
            argument: CompletionArgument {
                name: argument_name.into(),
                value: argument_value.into(),
            },
        };
        self.request(
            methods::COMPLETION_COMPLETE,
            Some(serde_json::to_value(&params)?),
            &RequestOptions::default(),
        )
        .await
    }

    /// Generic escape hatch: send any request with full control over
    /// timeout, cancellation, and the progress token.
    pub async fn send_request<R>(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        if method != methods::INITIALIZE && method != methods::PING {
            self.inner.ensure_ready()?;
        }
        self.request(method, params, &options).await
    }

    /// Send a one-way notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notification = JsonRpcNotification::new(method);
        if let Some(params) = params {
            notification = notification.with_params(params);
        }
        self.inner.correlator.notify(notification)
    }

    /// Close the transport. In-flight requests fail with `TransportClosed`.
    pub async fn close(&self) -> Result<()> {
        self.transport.lock().await.close().await
    }

    async fn request<R>(
        &self,
        method: &str,
        params: Option<Value>,
        options: &RequestOptions,
    ) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut request = JsonRpcRequest::new(self.inner.next_id(), method);
        if let Some(mut params) = params {
            if let Some(token) = &options.progress_token {
                if let Some(object) = params.as_object_mut() {
                    let meta = object
                        .entry("_meta")
                        .or_insert_with(|| serde_json::json!({}));
                    if let Some(meta) = meta.as_object_mut() {
                        meta.insert(
                            "progressToken".into(),
                            serde_json::to_value(token).unwrap_or_default(),
                        );
                    }
                }
            }
            request = request.with_params(params);
        }

        let result = self.inner.correlator.request(request, options).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Internal(format!("failed to decode {method} result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess;

    #[tokio::test]
    async fn test_operations_gated_before_initialize() {
        let (client_side, _server_side) = inprocess::default_pair();
        let client = ClientBuilder::new("t", "0")
            .connect(client_side)
            .await
            .unwrap();

        // NotInitialized fails locally, without wire traffic.
        let err = client.list_tools(None).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        let err = client
            .call_tool("echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn test_request_ids_increment() {
        let (client_side, mut server_side) = inprocess::default_pair();
        let client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_millis(200))
            .connect(client_side)
            .await
            .unwrap();

        let mut rx = server_side.incoming().unwrap();
        let pinger = client.clone();
        tokio::spawn(async move {
            let _ = pinger.ping().await;
        });

        let frame = rx.recv().await.unwrap();
        let Frame::Request(request) = frame else {
            panic!("expected request");
        };
        assert_eq!(request.id, RequestId::Number(1));
        assert_eq!(request.method, "ping");
    }

    #[tokio::test]
    async fn test_progress_token_injected_into_meta() {
        let (client_side, mut server_side) = inprocess::default_pair();
        let client = ClientBuilder::new("t", "0")
            .request_timeout(Duration::from_millis(200))
            .connect(client_side)
            .await
            .unwrap();

        let mut rx = server_side.incoming().unwrap();
        let requester = client.clone();
        tokio::spawn(async move {
            let options = RequestOptions::new()
                .progress_token(crate::protocol::ProgressToken::Number(77));
            let _: Result<Value> = requester
                .send_request(methods::PING, Some(serde_json::json!({})), options)
                .await;
        });

        let frame = rx.recv().await.unwrap();
        let Frame::Request(request) = frame else {
            panic!("expected request");
        };
        assert_eq!(request.params.unwrap()["_meta"]["progressToken"], 77);
    }
}
