//! Hooks and middleware
//!
//! Hooks are ordered callback chains fired at lifecycle points: session
//! register/unregister, before and after every method dispatch, and on
//! dispatch errors. Registration appends; the chains are frozen when the
//! server starts serving, so firing them takes no lock.
//!
//! Middleware wraps a capability handler with a same-signature handler.
//! Middlewares compose outermost-first in registration order and exist
//! separately per capability family.

use std::sync::Arc;

use serde_json::Value;

use crate::error::JsonRpcError;
use crate::prompt::PromptHandler;
use crate::protocol::RequestId;
use crate::resource::ResourceHandler;
use crate::session::SessionSnapshot;
use crate::tool::ToolHandler;

type SessionHook = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;
type BeforeHook = Arc<dyn Fn(&RequestId, &str) + Send + Sync>;
type AfterHook = Arc<dyn Fn(&RequestId, &str, &Value) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&RequestId, &str, &JsonRpcError) + Send + Sync>;

/// Frozen hook chains. Built once; cheap to fire.
#[derive(Clone, Default)]
pub struct Hooks {
    session_register: Vec<SessionHook>,
    session_unregister: Vec<SessionHook>,
    before_any: Vec<BeforeHook>,
    after_any: Vec<AfterHook>,
    on_error: Vec<ErrorHook>,
}

impl Hooks {
    pub fn builder() -> HooksBuilder {
        HooksBuilder::default()
    }

    pub(crate) fn fire_session_register(&self, snapshot: &SessionSnapshot) {
        for hook in &self.session_register {
            hook(snapshot);
        }
    }

    pub(crate) fn fire_session_unregister(&self, snapshot: &SessionSnapshot) {
        for hook in &self.session_unregister {
            hook(snapshot);
        }
    }

    pub(crate) fn fire_before_any(&self, id: &RequestId, method: &str) {
        for hook in &self.before_any {
            hook(id, method);
        }
    }

    pub(crate) fn fire_after_any(&self, id: &RequestId, method: &str, result: &Value) {
        for hook in &self.after_any {
            hook(id, method, result);
        }
    }

    pub(crate) fn fire_on_error(&self, id: &RequestId, method: &str, error: &JsonRpcError) {
        for hook in &self.on_error {
            hook(id, method, error);
        }
    }
}

/// Accumulates hook registrations before the server starts serving.
#[derive(Default)]
pub struct HooksBuilder {
    hooks: Hooks,
}

impl HooksBuilder {
    /// Fired after a session is registered (initialize succeeded).
    pub fn on_session_register<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.hooks.session_register.push(Arc::new(hook));
        self
    }

    /// Fired after a session is dropped (transport close or explicit
    /// unregister).
    pub fn on_session_unregister<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.hooks.session_unregister.push(Arc::new(hook));
        self
    }

    /// Fired before every method dispatch.
    pub fn before_any<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestId, &str) + Send + Sync + 'static,
    {
        self.hooks.before_any.push(Arc::new(hook));
        self
    }

    /// Fired after every successful dispatch, with the encoded result.
    pub fn after_any<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestId, &str, &Value) + Send + Sync + 'static,
    {
        self.hooks.after_any.push(Arc::new(hook));
        self
    }

    /// Fired when a dispatch produces an error response.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestId, &str, &JsonRpcError) + Send + Sync + 'static,
    {
        self.hooks.on_error.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Hooks {
        self.hooks
    }
}

/// Handler-wrapping middleware, one stack per capability family.
pub type ToolMiddleware =
    Arc<dyn Fn(Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> + Send + Sync>;
pub type ResourceMiddleware =
    Arc<dyn Fn(Arc<dyn ResourceHandler>) -> Arc<dyn ResourceHandler> + Send + Sync>;
pub type PromptMiddleware =
    Arc<dyn Fn(Arc<dyn PromptHandler>) -> Arc<dyn PromptHandler> + Send + Sync>;

/// Per-family middleware stacks, frozen at serve time.
#[derive(Clone, Default)]
pub struct MiddlewareStacks {
    pub(crate) tools: Vec<ToolMiddleware>,
    pub(crate) resources: Vec<ResourceMiddleware>,
    pub(crate) prompts: Vec<PromptMiddleware>,
}

impl MiddlewareStacks {
    /// Wrap a tool handler; the first-registered middleware ends up
    /// outermost.
    pub(crate) fn wrap_tool(&self, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        self.tools.iter().rev().fold(handler, |h, m| m(h))
    }

    pub(crate) fn wrap_resource(
        &self,
        handler: Arc<dyn ResourceHandler>,
    ) -> Arc<dyn ResourceHandler> {
        self.resources.iter().rev().fold(handler, |h, m| m(h))
    }

    pub(crate) fn wrap_prompt(&self, handler: Arc<dyn PromptHandler>) -> Arc<dyn PromptHandler> {
        self.prompts.iter().rev().fold(handler, |h, m| m(h))
    }
}
