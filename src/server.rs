//! MCP server engine
//!
//! Dispatches inbound requests to the capability registry, tracks sessions,
//! fires hook chains around every dispatch, and fans out change
//! notifications to connected clients.
//!
//! The engine is transport-agnostic: [`Server::serve`] drives a
//! connection-oriented transport (stdio, in-process) to completion, while
//! the HTTP transports create a [`ServerConnection`] per remote session and
//! feed frames through [`ServerConnection::handle`].
//!
//! # Example
//!
//! ```rust
//! use mcp_conduit::server::Server;
//! use mcp_conduit::tool::Tool;
//! use mcp_conduit::protocol::CallToolResult;
//!
//! let server = Server::builder()
//!     .server_info("my-server", "1.0.0")
//!     .tool(Tool::builder("echo").handler(|args: serde_json::Value, _ctx| async move {
//!         let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
//!         Ok(CallToolResult::text(message))
//!     }))
//!     .build();
//! # let _ = server;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use serde_json::Value;

use crate::codec::Frame;
use crate::context::{CancellationToken, NotificationReceiver, RequestContext};
use crate::error::{Error, JsonRpcError, Result};
use crate::hooks::{
    Hooks, MiddlewareStacks, PromptMiddleware, ResourceMiddleware, ToolMiddleware,
};
use crate::prompt::Prompt;
use crate::protocol::{
    methods, notifications, CallToolParams, CancelledParams, CompleteParams, CompleteResult,
    Completion, EmptyResult, GetPromptParams, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsParams,
    ListResourceTemplatesParams, ListResourcesParams, ListToolsParams, ProgressToken,
    ReadResourceParams, RequestId, ResourceUpdatedParams, ServerCapabilities, SetLevelParams,
    SubscribeParams, UnsubscribeParams, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::registry::{Registry, ResolvedResource, DEFAULT_PAGE_SIZE};
use crate::resource::{Resource, ResourceTemplate};
use crate::session::{PhaseState, Session, SessionManager};
use crate::tool::{HandlerFuture, Tool};
use crate::transport::{FrameSender, Transport};

/// Default bound on each session's notification mailbox.
pub const DEFAULT_MAILBOX_BUFFER: usize = 256;

/// Handler for `completion/complete`. The default returns no suggestions.
pub trait CompletionHandler: Send + Sync {
    fn complete(&self, params: CompleteParams, ctx: RequestContext) -> HandlerFuture<CompleteResult>;
}

impl<F, Fut> CompletionHandler for F
where
    F: Fn(CompleteParams, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<CompleteResult>> + Send + 'static,
{
    fn complete(&self, params: CompleteParams, ctx: RequestContext) -> HandlerFuture<CompleteResult> {
        Box::pin(self(params, ctx))
    }
}

struct ServerInner {
    info: Implementation,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    registry: Registry,
    sessions: SessionManager,
    hooks: Hooks,
    middleware: MiddlewareStacks,
    recovery: bool,
    completion: Option<Arc<dyn CompletionHandler>>,
    mailbox_buffer: usize,
}

impl ServerInner {
    /// Does the declared capability set accept this method family? Disabled
    /// families answer MethodNotFound, as if the methods did not exist.
    fn accepts_method(&self, method: &str) -> bool {
        match method {
            methods::TOOLS_LIST | methods::TOOLS_CALL => self.capabilities.tools.is_some(),
            methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => self
                .capabilities
                .resources
                .as_ref()
                .is_some_and(|r| r.subscribe),
            methods::RESOURCES_LIST
            | methods::RESOURCES_TEMPLATES_LIST
            | methods::RESOURCES_READ => self.capabilities.resources.is_some(),
            methods::PROMPTS_LIST | methods::PROMPTS_GET => self.capabilities.prompts.is_some(),
            methods::LOGGING_SET_LEVEL => self.capabilities.logging.is_some(),
            _ => true,
        }
    }

    fn declares_tools_list_changed(&self) -> bool {
        self.capabilities
            .tools
            .as_ref()
            .is_some_and(|t| t.list_changed)
    }

    fn declares_resources_list_changed(&self) -> bool {
        self.capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.list_changed)
    }

    fn declares_resource_subscribe(&self) -> bool {
        self.capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.subscribe)
    }

    fn declares_prompts_list_changed(&self) -> bool {
        self.capabilities
            .prompts
            .as_ref()
            .is_some_and(|p| p.list_changed)
    }
}

/// The MCP server engine. Cloneable handle; clones share all state, so
/// capabilities can be added or removed while serving.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Registry mutations after clients have connected fan out the matching
    /// `*/list_changed` notification, provided the capability set declares
    /// the change notification.
    pub fn add_tool(&self, tool: Tool) {
        self.inner.registry.add_tool(tool);
        if self.inner.declares_tools_list_changed() {
            self.broadcast(notifications::TOOLS_LIST_CHANGED);
        }
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let removed = self.inner.registry.remove_tool(name);
        if removed && self.inner.declares_tools_list_changed() {
            self.broadcast(notifications::TOOLS_LIST_CHANGED);
        }
        removed
    }

    pub fn add_resource(&self, resource: Resource) {
        self.inner.registry.add_resource(resource);
        if self.inner.declares_resources_list_changed() {
            self.broadcast(notifications::RESOURCES_LIST_CHANGED);
        }
    }

    pub fn remove_resource(&self, uri: &str) -> bool {
        let removed = self.inner.registry.remove_resource(uri);
        if removed && self.inner.declares_resources_list_changed() {
            self.broadcast(notifications::RESOURCES_LIST_CHANGED);
        }
        removed
    }

    pub fn add_template(&self, template: ResourceTemplate) {
        self.inner.registry.add_template(template);
        if self.inner.declares_resources_list_changed() {
            self.broadcast(notifications::RESOURCES_LIST_CHANGED);
        }
    }

    pub fn remove_template(&self, uri_template: &str) -> bool {
        let removed = self.inner.registry.remove_template(uri_template);
        if removed && self.inner.declares_resources_list_changed() {
            self.broadcast(notifications::RESOURCES_LIST_CHANGED);
        }
        removed
    }

    pub fn add_prompt(&self, prompt: Prompt) {
        self.inner.registry.add_prompt(prompt);
        if self.inner.declares_prompts_list_changed() {
            self.broadcast(notifications::PROMPTS_LIST_CHANGED);
        }
    }

    pub fn remove_prompt(&self, name: &str) -> bool {
        let removed = self.inner.registry.remove_prompt(name);
        if removed && self.inner.declares_prompts_list_changed() {
            self.broadcast(notifications::PROMPTS_LIST_CHANGED);
        }
        removed
    }

    /// Announce a content change for `uri` to the sessions subscribed to it.
    /// A no-op when the capability set does not declare subscriptions.
    pub fn notify_resource_updated(&self, uri: &str) {
        if !self.inner.declares_resource_subscribe() {
            return;
        }
        let params = ResourceUpdatedParams { uri: uri.into() };
        let notification = JsonRpcNotification::new(notifications::RESOURCE_UPDATED)
            .with_params(serde_json::to_value(params).unwrap_or_default());
        for session in self.inner.sessions.all() {
            if session.is_subscribed(uri) {
                session.notify(notification.clone());
            }
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Create connection state for a transport-managed peer.
    pub fn connection(&self) -> ServerConnection {
        ServerConnection {
            state: Arc::new(ConnState {
                server: self.clone(),
                phase: PhaseState::new(),
                session: RwLock::new(None),
                outbound: None,
                mailbox: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn connection_with_outbound(&self, sender: FrameSender) -> ServerConnection {
        ServerConnection {
            state: Arc::new(ConnState {
                server: self.clone(),
                phase: PhaseState::new(),
                session: RwLock::new(None),
                outbound: Some(sender),
                mailbox: Mutex::new(None),
            }),
        }
    }

    /// Drive one connection-oriented transport to completion. Returns when
    /// the peer disconnects or the transport closes.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<()> {
        transport.start().await?;
        let sender = transport.sender();
        let mut incoming = transport
            .incoming()
            .ok_or_else(|| Error::Internal("transport incoming stream already taken".into()))?;
        let closed = transport.closed();
        let connection = self.connection_with_outbound(sender.clone());

        loop {
            tokio::select! {
                maybe = incoming.recv() => match maybe {
                    Some(frame) => match frame {
                        // Notifications are cheap and order-sensitive:
                        // handle them inline. Requests run on their own
                        // tasks so one slow handler cannot stall the loop
                        // or serialize against other handlers.
                        Frame::Notification(_) | Frame::Response(_) => {
                            let _ = connection.handle(frame).await;
                        }
                        _ => {
                            let connection = connection.clone();
                            let sender = sender.clone();
                            tokio::spawn(async move {
                                if let Some(response) = connection.handle(frame).await {
                                    if let Err(e) = sender.send_wait(response).await {
                                        tracing::debug!(error = %e, "response not delivered");
                                    }
                                }
                            });
                        }
                    },
                    None => break,
                },
                _ = closed.wait() => break,
            }
        }

        connection.teardown();
        Ok(())
    }

    fn broadcast(&self, method: &str) {
        let notification = JsonRpcNotification::new(method);
        for session in self.inner.sessions.all() {
            if session.phase().is_initialized() {
                session.notify(notification.clone());
            }
        }
    }
}

struct ConnState {
    server: Server,
    phase: PhaseState,
    session: RwLock<Option<Arc<Session>>>,
    /// When set, the session mailbox is pumped into this sender as soon as
    /// the session registers (connection-oriented transports).
    outbound: Option<FrameSender>,
    /// Otherwise the receiver parks here for the transport to take (HTTP).
    mailbox: Mutex<Option<NotificationReceiver>>,
}

/// Per-peer connection state: the phase gate plus the session record once
/// initialize has succeeded.
#[derive(Clone)]
pub struct ServerConnection {
    state: Arc<ConnState>,
}

impl ServerConnection {
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state
            .session
            .read()
            .expect("connection lock poisoned")
            .clone()
    }

    /// Take the session's notification mailbox, available after initialize
    /// on connections without an outbound sender.
    pub fn take_mailbox(&self) -> Option<NotificationReceiver> {
        self.state
            .mailbox
            .lock()
            .expect("connection lock poisoned")
            .take()
    }

    /// Tear down the connection's session: cancel in-flight work, drop
    /// subscriptions, fire the unregister hooks.
    pub fn teardown(&self) {
        let session = self
            .state
            .session
            .write()
            .expect("connection lock poisoned")
            .take();
        if let Some(session) = session {
            let server = &self.state.server.inner;
            if let Some(removed) = server.sessions.unregister(session.id()) {
                server.hooks.fire_session_unregister(&removed.snapshot());
            }
        }
    }

    /// Handle one inbound frame. Requests resolve to `Some(response)`;
    /// notifications and responses to `None`. Batch elements are processed
    /// in receive order and their responses batched back.
    pub async fn handle(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Batch(frames) => {
                let mut responses = Vec::new();
                for frame in frames {
                    if let Some(response) = self.handle_single(frame).await {
                        responses.push(response);
                    }
                }
                (!responses.is_empty()).then_some(Frame::Batch(responses))
            }
            frame => self.handle_single(frame).await,
        }
    }

    async fn handle_single(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Request(request) => self
                .handle_request(request)
                .await
                .map(Frame::Response),
            Frame::Notification(notification) => {
                self.handle_notification(notification);
                None
            }
            Frame::Response(response) => {
                // This engine does not originate requests; an unexpected
                // response is a peer protocol violation. Log and drop.
                tracing::debug!(id = ?response.id(), "dropping unexpected response frame");
                None
            }
            Frame::Batch(_) => {
                // The codec rejects nested batches; nothing to do here.
                tracing::debug!("dropping nested batch frame");
                None
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();

        if let Err(e) = request.validate() {
            return Some(JsonRpcResponse::error(Some(id), e));
        }
        if !self.state.phase.is_request_allowed(&method) {
            return Some(JsonRpcResponse::error(
                Some(id),
                JsonRpcError::invalid_request(format!(
                    "method '{}' before initialize completed",
                    method
                )),
            ));
        }

        let server = &self.state.server.inner;
        server.hooks.fire_before_any(&id, &method);

        let outcome = self.dispatch(&id, &method, request.params).await;

        match outcome {
            Ok(result) => {
                server.hooks.fire_after_any(&id, &method, &result);
                Some(JsonRpcResponse::result(id, result))
            }
            Err(error) => {
                let rpc = error.to_json_rpc();
                server.hooks.fire_on_error(&id, &method, &rpc);
                Some(JsonRpcResponse::error(Some(id), rpc))
            }
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            notifications::INITIALIZED => {
                self.state.phase.mark_initialized();
                if let Some(session) = self.session() {
                    tracing::debug!(session_id = %session.id(), "session initialized");
                }
            }
            notifications::CANCELLED | notifications::CANCELLED_ALIAS => {
                let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                else {
                    tracing::debug!("dropping malformed cancellation notification");
                    return;
                };
                if let Some(session) = self.session() {
                    if !session.cancel_request(&params.request_id) {
                        tracing::debug!(id = %params.request_id, "cancellation for unknown request");
                    }
                }
            }
            other => {
                tracing::debug!(method = %other, "ignoring unhandled notification");
            }
        }
    }

    /// The static dispatch table. Unknown methods, and methods of families
    /// the capability set leaves undeclared, answer -32601.
    async fn dispatch(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        if !self.state.server.inner.accepts_method(method) {
            return Err(Error::JsonRpc(JsonRpcError::method_not_found(method)));
        }
        match method {
            methods::INITIALIZE => {
                let params: InitializeParams = required_params(params)?;
                self.handle_initialize(params)
            }
            methods::PING => encode(EmptyResult {}),
            methods::TOOLS_LIST => {
                let params: ListToolsParams = optional_params(params)?;
                encode(
                    self.state
                        .server
                        .inner
                        .registry
                        .list_tools(params.cursor.as_deref()),
                )
            }
            methods::TOOLS_CALL => self.handle_tool_call(id, params).await,
            methods::RESOURCES_LIST => {
                let params: ListResourcesParams = optional_params(params)?;
                encode(
                    self.state
                        .server
                        .inner
                        .registry
                        .list_resources(params.cursor.as_deref()),
                )
            }
            methods::RESOURCES_TEMPLATES_LIST => {
                let params: ListResourceTemplatesParams = optional_params(params)?;
                encode(
                    self.state
                        .server
                        .inner
                        .registry
                        .list_templates(params.cursor.as_deref()),
                )
            }
            methods::RESOURCES_READ => self.handle_resource_read(id, params).await,
            methods::RESOURCES_SUBSCRIBE => {
                let params: SubscribeParams = required_params(params)?;
                let session = self.require_session()?;
                session.subscribe(params.uri);
                encode(EmptyResult {})
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                let params: UnsubscribeParams = required_params(params)?;
                let session = self.require_session()?;
                session.unsubscribe(&params.uri);
                encode(EmptyResult {})
            }
            methods::PROMPTS_LIST => {
                let params: ListPromptsParams = optional_params(params)?;
                encode(
                    self.state
                        .server
                        .inner
                        .registry
                        .list_prompts(params.cursor.as_deref()),
                )
            }
            methods::PROMPTS_GET => self.handle_prompt_get(id, params).await,
            methods::LOGGING_SET_LEVEL => {
                let params: SetLevelParams = required_params(params)?;
                let session = self.require_session()?;
                session.log_gate().set(params.level);
                encode(EmptyResult {})
            }
            methods::COMPLETION_COMPLETE => self.handle_complete(id, params).await,
            other => Err(Error::JsonRpc(JsonRpcError::method_not_found(other))),
        }
    }

    fn handle_initialize(&self, params: InitializeParams) -> Result<Value> {
        let server = &self.state.server.inner;

        // Version negotiation: accept the client's version when we speak
        // it, otherwise answer with the latest we do.
        let version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version.clone()
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        };

        let (session, mailbox_rx) = server.sessions.register(
            version.clone(),
            params.client_info,
            params.capabilities,
            self.state.phase.clone(),
            server.mailbox_buffer,
        );

        match &self.state.outbound {
            Some(sender) => {
                tokio::spawn(pump_mailbox(mailbox_rx, sender.clone()));
            }
            None => {
                *self.state.mailbox.lock().expect("connection lock poisoned") = Some(mailbox_rx);
            }
        }

        {
            let mut slot = self.state.session.write().expect("connection lock poisoned");
            if let Some(previous) = slot.replace(session.clone()) {
                // Re-initialize on a live connection: the old session is
                // dropped first.
                if let Some(removed) = server.sessions.unregister(previous.id()) {
                    server.hooks.fire_session_unregister(&removed.snapshot());
                }
            }
        }

        self.state.phase.mark_initializing();
        server.hooks.fire_session_register(&session.snapshot());
        tracing::info!(
            session_id = %session.id(),
            client = %session.client_info().name,
            version = %version,
            "session created"
        );

        encode(InitializeResult {
            protocol_version: version,
            capabilities: server.capabilities.clone(),
            server_info: server.info.clone(),
            instructions: server.instructions.clone(),
        })
    }

    async fn handle_tool_call(&self, id: &RequestId, params: Option<Value>) -> Result<Value> {
        let progress_token = progress_token_of(&params);
        let params: CallToolParams = required_params(params)?;

        let server = &self.state.server.inner;
        let tool = server.registry.find_tool(&params.name).ok_or_else(|| {
            Error::JsonRpc(JsonRpcError::invalid_params(format!(
                "unknown tool: {}",
                params.name
            )))
        })?;

        let handler = server.middleware.wrap_tool(tool.handler());
        let (ctx, guard) = self.request_context(id, progress_token);
        let result = self
            .invoke(handler.call(params.arguments, ctx))
            .await;
        drop(guard);
        encode(result?)
    }

    async fn handle_resource_read(&self, id: &RequestId, params: Option<Value>) -> Result<Value> {
        let progress_token = progress_token_of(&params);
        let params: ReadResourceParams = required_params(params)?;

        let server = &self.state.server.inner;
        let resolved = server.registry.find_resource(&params.uri).ok_or_else(|| {
            Error::JsonRpc(JsonRpcError::invalid_params(format!(
                "unknown resource: {}",
                params.uri
            )))
        })?;

        let (ctx, guard) = self.request_context(id, progress_token);
        let result = match resolved {
            ResolvedResource::Concrete(resource) => {
                let handler = server.middleware.wrap_resource(resource.handler());
                self.invoke(handler.read(params.uri, ctx)).await
            }
            ResolvedResource::Template(template, variables) => {
                let handler = template.handler();
                self.invoke(handler.read(params.uri, variables, ctx)).await
            }
        };
        drop(guard);
        encode(result?)
    }

    async fn handle_prompt_get(&self, id: &RequestId, params: Option<Value>) -> Result<Value> {
        let params: GetPromptParams = required_params(params)?;

        let server = &self.state.server.inner;
        let prompt = server.registry.find_prompt(&params.name).ok_or_else(|| {
            Error::JsonRpc(JsonRpcError::invalid_params(format!(
                "unknown prompt: {}",
                params.name
            )))
        })?;

        let handler = server.middleware.wrap_prompt(prompt.handler());
        let (ctx, guard) = self.request_context(id, None);
        let result = self.invoke(handler.get(params.arguments, ctx)).await;
        drop(guard);
        encode(result?)
    }

    async fn handle_complete(&self, id: &RequestId, params: Option<Value>) -> Result<Value> {
        let params: CompleteParams = required_params(params)?;
        let server = &self.state.server.inner;
        match &server.completion {
            Some(handler) => {
                let handler = handler.clone();
                let (ctx, guard) = self.request_context(id, None);
                let result = self.invoke(handler.complete(params, ctx)).await;
                drop(guard);
                encode(result?)
            }
            None => encode(CompleteResult {
                completion: Completion::default(),
            }),
        }
    }

    /// Build the context for a handler invocation and track it for
    /// cancellation. The returned guard untracks on drop.
    fn request_context(
        &self,
        id: &RequestId,
        progress_token: Option<ProgressToken>,
    ) -> (RequestContext, InFlightGuard) {
        let token = CancellationToken::new();
        let mut ctx = RequestContext::new(id.clone()).with_cancellation(token.clone());
        if let Some(progress) = progress_token {
            ctx = ctx.with_progress_token(progress);
        }

        let session = self.session();
        if let Some(ref session) = session {
            ctx = ctx
                .with_session_id(session.id())
                .with_mailbox(session.mailbox_sender())
                .with_log_gate(session.log_gate().clone());
            session.track(id.clone(), token);
        }

        (
            ctx,
            InFlightGuard {
                session,
                id: id.clone(),
            },
        )
    }

    /// Run a handler future, converting panics into internal errors when
    /// recovery is enabled.
    async fn invoke<T>(&self, fut: HandlerFuture<T>) -> Result<T> {
        if !self.state.server.inner.recovery {
            return fut.await;
        }
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(panic = %message, "handler panicked; recovered");
                Err(Error::Internal(message))
            }
        }
    }

    fn require_session(&self) -> Result<Arc<Session>> {
        self.session()
            .ok_or_else(|| Error::JsonRpc(JsonRpcError::invalid_request("no session established")))
    }
}

/// Untracks an in-flight request when the dispatch finishes.
struct InFlightGuard {
    session: Option<Arc<Session>>,
    id: RequestId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.untrack(&self.id);
        }
    }
}

/// Forward a session mailbox into the transport, preserving emission order.
async fn pump_mailbox(mut mailbox: NotificationReceiver, sender: FrameSender) {
    while let Some(notification) = mailbox.recv().await {
        if sender
            .send_wait(Frame::Notification(notification))
            .await
            .is_err()
        {
            break;
        }
    }
}

fn encode<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Params that must be present for the method to make sense.
fn required_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let value = params
        .ok_or_else(|| Error::JsonRpc(JsonRpcError::invalid_params("missing params")))?;
    serde_json::from_value(value)
        .map_err(|e| Error::JsonRpc(JsonRpcError::invalid_params(e.to_string())))
}

/// Params where absence means defaults (list methods).
fn optional_params<T: serde::de::DeserializeOwned + Default>(params: Option<Value>) -> Result<T> {
    match params {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::JsonRpc(JsonRpcError::invalid_params(e.to_string()))),
        None => Ok(T::default()),
    }
}

fn progress_token_of(params: &Option<Value>) -> Option<ProgressToken> {
    let token = params.as_ref()?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    info: Implementation,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    templates: Vec<ResourceTemplate>,
    prompts: Vec<Prompt>,
    page_size: usize,
    hooks: Hooks,
    middleware: MiddlewareStacks,
    recovery: bool,
    completion: Option<Arc<dyn CompletionHandler>>,
    mailbox_buffer: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            info: Implementation {
                name: "mcp-conduit".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
            instructions: None,
            capabilities: ServerCapabilities::all(),
            tools: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            prompts: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            hooks: Hooks::default(),
            middleware: MiddlewareStacks::default(),
            recovery: true,
            completion: None,
            mailbox_buffer: DEFAULT_MAILBOX_BUFFER,
        }
    }

    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Override the declared capability set. Defaults to
    /// [`ServerCapabilities::all`]. A family left as `None` is not
    /// advertised at initialize and its methods answer MethodNotFound;
    /// cleared `list_changed`/`subscribe` flags suppress the matching
    /// notifications.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mcp_conduit::server::Server;
    /// use mcp_conduit::protocol::{ServerCapabilities, ToolsCapability};
    ///
    /// // A tools-only server: no resources, prompts, or logging.
    /// let server = Server::builder()
    ///     .capabilities(ServerCapabilities {
    ///         tools: Some(ToolsCapability { list_changed: true }),
    ///         ..Default::default()
    ///     })
    ///     .build();
    /// # let _ = server;
    /// ```
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Page size for the cursor-paginated listings.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn template(mut self, template: ResourceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn prompt(mut self, prompt: Prompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn tool_middleware(mut self, middleware: ToolMiddleware) -> Self {
        self.middleware.tools.push(middleware);
        self
    }

    pub fn resource_middleware(mut self, middleware: ResourceMiddleware) -> Self {
        self.middleware.resources.push(middleware);
        self
    }

    pub fn prompt_middleware(mut self, middleware: PromptMiddleware) -> Self {
        self.middleware.prompts.push(middleware);
        self
    }

    /// Disable the panic boundary around handlers. On by default.
    pub fn without_recovery(mut self) -> Self {
        self.recovery = false;
        self
    }

    pub fn completion_handler<H>(mut self, handler: H) -> Self
    where
        H: CompletionHandler + 'static,
    {
        self.completion = Some(Arc::new(handler));
        self
    }

    pub fn mailbox_buffer(mut self, buffer: usize) -> Self {
        self.mailbox_buffer = buffer.max(1);
        self
    }

    pub fn build(self) -> Server {
        let registry = Registry::new(self.page_size);
        for tool in self.tools {
            registry.add_tool(tool);
        }
        for resource in self.resources {
            registry.add_resource(resource);
        }
        for template in self.templates {
            registry.add_template(template);
        }
        for prompt in self.prompts {
            registry.add_prompt(prompt);
        }

        Server {
            inner: Arc::new(ServerInner {
                info: self.info,
                instructions: self.instructions,
                capabilities: self.capabilities,
                registry,
                sessions: SessionManager::new(),
                hooks: self.hooks,
                middleware: self.middleware,
                recovery: self.recovery,
                completion: self.completion,
                mailbox_buffer: self.mailbox_buffer,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallToolResult;

    fn request(id: i64, method: &str, params: Value) -> Frame {
        Frame::Request(JsonRpcRequest::new(id, method).with_params(params))
    }

    fn initialize_params() -> Value {
        serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.1"}
        })
    }

    async fn initialized_connection(server: &Server) -> ServerConnection {
        let connection = server.connection();
        let response = connection
            .handle(request(1, methods::INITIALIZE, initialize_params()))
            .await;
        assert!(response.is_some());
        let _ = connection
            .handle(Frame::Notification(JsonRpcNotification::new(
                notifications::INITIALIZED,
            )))
            .await;
        connection
    }

    fn echo_server() -> Server {
        Server::builder()
            .server_info("test-server", "0.0.1")
            .tool(
                Tool::builder("echo").handler(|args: Value, _ctx| async move {
                    let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                    Ok(CallToolResult::text(message))
                }),
            )
            .build()
    }

    fn result_of(frame: Frame) -> Value {
        match frame {
            Frame::Response(JsonRpcResponse::Result(r)) => r.result,
            other => panic!("expected result response, got {other:?}"),
        }
    }

    fn error_of(frame: Frame) -> JsonRpcError {
        match frame {
            Frame::Response(JsonRpcResponse::Error(e)) => e.error,
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let server = echo_server();
        let connection = server.connection();
        let response = connection
            .handle(request(1, methods::INITIALIZE, initialize_params()))
            .await
            .unwrap();
        let result = result_of(response);
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_version_answers_latest() {
        let server = echo_server();
        let connection = server.connection();
        let response = connection
            .handle(request(
                1,
                methods::INITIALIZE,
                serde_json::json!({
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "clientInfo": {"name": "c", "version": "0"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(result_of(response)["protocolVersion"], LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_methods_gated_before_initialize() {
        let server = echo_server();
        let connection = server.connection();
        let response = connection
            .handle(request(1, methods::TOOLS_LIST, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(error_of(response).code, -32600);

        // Ping is exempt from the gate.
        let response = connection
            .handle(request(2, methods::PING, serde_json::json!({})))
            .await
            .unwrap();
        result_of(response);
    }

    #[tokio::test]
    async fn test_tool_call_echo() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;

        let response = connection
            .handle(request(
                2,
                methods::TOOLS_CALL,
                serde_json::json!({"name": "echo", "arguments": {"message": "hi"}}),
            ))
            .await
            .unwrap();
        let result = result_of(response);
        assert_eq!(
            result["content"],
            serde_json::json!([{"type": "text", "text": "hi"}])
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_32601() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;
        let response = connection
            .handle(request(3, "tools/fly", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(error_of(response).code, -32601);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;
        let response = connection
            .handle(request(
                3,
                methods::TOOLS_CALL,
                serde_json::json!({"name": "ghost", "arguments": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(error_of(response).code, -32602);
    }

    #[tokio::test]
    async fn test_handler_panic_recovered() {
        let server = Server::builder()
            .tool(Tool::builder("explode").handler(|_args: Value, _ctx| async move {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok(CallToolResult::text(""))
            }))
            .build();
        let connection = initialized_connection(&server).await;

        let response = connection
            .handle(request(
                4,
                methods::TOOLS_CALL,
                serde_json::json!({"name": "explode", "arguments": {}}),
            ))
            .await
            .unwrap();
        let error = error_of(response);
        assert_eq!(error.code, -32603);
        assert!(error.message.contains("kaboom"));

        // The engine survives; the next call still works.
        let response = connection
            .handle(request(5, methods::PING, serde_json::json!({})))
            .await
            .unwrap();
        result_of(response);
    }

    #[tokio::test]
    async fn test_template_resource_read() {
        use crate::protocol::{ReadResourceResult, ResourceContent};
        use std::collections::HashMap;

        let server = Server::builder()
            .template(ResourceTemplate::builder("users://{id}").handler(
                |uri: String, vars: HashMap<String, String>, _ctx| async move {
                    let id = vars.get("id").cloned().unwrap_or_default();
                    Ok(ReadResourceResult {
                        contents: vec![ResourceContent::text(
                            uri,
                            "application/json",
                            format!("{{\"id\":\"{id}\"}}"),
                        )],
                    })
                },
            ))
            .build();
        let connection = initialized_connection(&server).await;

        let response = connection
            .handle(request(
                2,
                methods::RESOURCES_READ,
                serde_json::json!({"uri": "users://42"}),
            ))
            .await
            .unwrap();
        let result = result_of(response);
        assert_eq!(result["contents"][0]["text"], "{\"id\":\"42\"}");
    }

    #[tokio::test]
    async fn test_subscribe_then_updated_notification() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;
        let mut mailbox = connection.take_mailbox().unwrap();

        let response = connection
            .handle(request(
                2,
                methods::RESOURCES_SUBSCRIBE,
                serde_json::json!({"uri": "users://42"}),
            ))
            .await
            .unwrap();
        result_of(response);

        server.notify_resource_updated("users://42");
        let notification = mailbox.recv().await.unwrap();
        assert_eq!(notification.method, notifications::RESOURCE_UPDATED);
        assert_eq!(notification.params.unwrap()["uri"], "users://42");

        // Sessions not subscribed to the URI stay quiet.
        server.notify_resource_updated("users://other");
        assert!(mailbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_changed_fanout_to_initialized_sessions() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;
        let mut mailbox = connection.take_mailbox().unwrap();

        server.add_tool(
            Tool::builder("late").handler(|_a: Value, _c| async { Ok(CallToolResult::text("")) }),
        );
        let notification = mailbox.recv().await.unwrap();
        assert_eq!(notification.method, notifications::TOOLS_LIST_CHANGED);

        // And the listing reflects the addition.
        let response = connection
            .handle(request(9, methods::TOOLS_LIST, serde_json::json!({})))
            .await
            .unwrap();
        let tools = result_of(response)["tools"].as_array().unwrap().len();
        assert_eq!(tools, 2);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_handler() {
        use std::time::Duration;

        let server = Server::builder()
            .tool(Tool::builder("sleepy").handler(|_args: Value, ctx: RequestContext| async move {
                let token = ctx.cancellation_token();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        Ok(CallToolResult::text("finished"))
                    }
                    _ = token.cancelled() => {
                        Err(Error::Cancelled)
                    }
                }
            }))
            .build();
        let connection = initialized_connection(&server).await;

        let call = connection.clone();
        let handle = tokio::spawn(async move {
            call.handle(request(
                7,
                methods::TOOLS_CALL,
                serde_json::json!({"name": "sleepy", "arguments": {}}),
            ))
            .await
        });

        // Give the handler a moment to start, then cancel by id.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = connection
            .handle(Frame::Notification(
                JsonRpcNotification::new(notifications::CANCELLED).with_params(
                    serde_json::json!({"requestId": 7}),
                ),
            ))
            .await;

        let response = handle.await.unwrap().unwrap();
        assert_eq!(error_of(response).code, -32603);
    }

    #[tokio::test]
    async fn test_teardown_fires_unregister_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let unregistered = Arc::new(AtomicUsize::new(0));
        let counter = unregistered.clone();
        let server = Server::builder()
            .hooks(
                Hooks::builder()
                    .on_session_unregister(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .build(),
            )
            .build();

        let connection = initialized_connection(&server).await;
        assert_eq!(server.sessions().len(), 1);
        connection.teardown();
        assert_eq!(server.sessions().len(), 0);
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undeclared_families_are_method_not_found() {
        use crate::protocol::{ServerCapabilities, ToolsCapability};

        let server = Server::builder()
            .capabilities(ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                ..Default::default()
            })
            .tool(
                Tool::builder("echo").handler(|_args: Value, _ctx| async move {
                    Ok(CallToolResult::text("ok"))
                }),
            )
            .build();
        let connection = server.connection();

        // Only the tools family is advertised at initialize.
        let response = connection
            .handle(request(1, methods::INITIALIZE, initialize_params()))
            .await
            .unwrap();
        let result = result_of(response);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert!(result["capabilities"].get("resources").is_none());
        assert!(result["capabilities"].get("prompts").is_none());
        assert!(result["capabilities"].get("logging").is_none());

        // Tools still dispatch; everything else looks like a missing method.
        let response = connection
            .handle(request(2, methods::TOOLS_LIST, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(result_of(response)["tools"].as_array().unwrap().len(), 1);

        for method in [
            methods::RESOURCES_LIST,
            methods::RESOURCES_READ,
            methods::RESOURCES_SUBSCRIBE,
            methods::PROMPTS_LIST,
            methods::LOGGING_SET_LEVEL,
        ] {
            let response = connection
                .handle(request(3, method, serde_json::json!({"uri": "x://y"})))
                .await
                .unwrap();
            assert_eq!(error_of(response).code, -32601, "method {method}");
        }
    }

    #[tokio::test]
    async fn test_subscribe_flag_gates_subscription_methods() {
        use crate::protocol::{ResourcesCapability, ServerCapabilities};

        let server = Server::builder()
            .capabilities(ServerCapabilities {
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: true,
                }),
                ..ServerCapabilities::all()
            })
            .build();
        let connection = initialized_connection(&server).await;
        let mut mailbox = connection.take_mailbox().unwrap();

        let response = connection
            .handle(request(
                2,
                methods::RESOURCES_SUBSCRIBE,
                serde_json::json!({"uri": "users://42"}),
            ))
            .await
            .unwrap();
        assert_eq!(error_of(response).code, -32601);

        // With subscriptions undeclared, updates are never fanned out.
        server.notify_resource_updated("users://42");
        assert!(mailbox.try_recv().is_err());

        // Listing still works; only the subscription surface is gone.
        let response = connection
            .handle(request(3, methods::RESOURCES_LIST, serde_json::json!({})))
            .await
            .unwrap();
        result_of(response);
    }

    #[tokio::test]
    async fn test_cleared_list_changed_flag_suppresses_fanout() {
        use crate::protocol::{ServerCapabilities, ToolsCapability};

        let server = Server::builder()
            .capabilities(ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                ..ServerCapabilities::all()
            })
            .build();
        let connection = initialized_connection(&server).await;
        let mut mailbox = connection.take_mailbox().unwrap();

        server.add_tool(
            Tool::builder("quiet")
                .handler(|_a: Value, _c| async { Ok(CallToolResult::text("")) }),
        );
        assert!(mailbox.try_recv().is_err());

        // The registry mutation itself still lands.
        let response = connection
            .handle(request(2, methods::TOOLS_LIST, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(result_of(response)["tools"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_responses_in_order() {
        let server = echo_server();
        let connection = initialized_connection(&server).await;

        let batch = Frame::Batch(vec![
            request(10, methods::PING, serde_json::json!({})),
            request(11, methods::TOOLS_LIST, serde_json::json!({})),
        ]);
        let Some(Frame::Batch(responses)) = connection.handle(batch).await else {
            panic!("expected batch response");
        };
        assert_eq!(responses.len(), 2);
        let ids: Vec<_> = responses
            .iter()
            .map(|f| match f {
                Frame::Response(r) => r.id().cloned().unwrap(),
                other => panic!("expected response, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![RequestId::Number(10), RequestId::Number(11)]);
    }
}
