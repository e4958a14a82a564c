//! Tool definitions and handlers
//!
//! A [`Tool`] pairs the definition advertised by `tools/list` with the
//! handler invoked by `tools/call`. Handlers receive the raw arguments
//! object plus the request context; argument validation against the input
//! schema is a layered collaborator, not the engine's job.
//!
//! # Example
//!
//! ```rust
//! use mcp_conduit::tool::Tool;
//! use mcp_conduit::protocol::CallToolResult;
//!
//! let echo = Tool::builder("echo")
//!     .description("Echo the message argument back as text")
//!     .input_schema(serde_json::json!({
//!         "type": "object",
//!         "properties": { "message": { "type": "string" } },
//!         "required": ["message"]
//!     }))
//!     .handler(|args: serde_json::Value, _ctx| async move {
//!         let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
//!         Ok(CallToolResult::text(message))
//!     });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::RequestContext;
use crate::error::Result;
use crate::protocol::{CallToolResult, ToolAnnotations, ToolDefinition};

/// Boxed future returned by capability handlers. `'static` so the engine can
/// run handlers on spawned tasks.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Handler invoked by `tools/call`.
pub trait ToolHandler: Send + Sync {
    fn call(&self, args: Value, ctx: RequestContext) -> HandlerFuture<CallToolResult>;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
{
    fn call(&self, args: Value, ctx: RequestContext) -> HandlerFuture<CallToolResult> {
        Box::pin(self(args, ctx))
    }
}

/// A registered tool: definition plus handler.
#[derive(Clone)]
pub struct Tool {
    pub def: ToolDefinition,
    pub(crate) handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.def.name)
            .field("description", &self.def.description)
            .finish_non_exhaustive()
    }
}

impl Tool {
    pub fn builder(name: impl Into<String>) -> ToolBuilder {
        ToolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub(crate) fn handler(&self) -> Arc<dyn ToolHandler> {
        self.handler.clone()
    }
}

/// Builder for [`Tool`].
pub struct ToolBuilder {
    name: String,
    description: Option<String>,
    input_schema: Option<Value>,
    annotations: Option<ToolAnnotations>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
            annotations: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Raw JSON schema for the tool's arguments. Defaults to an
    /// unconstrained object.
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Finish with the handler function.
    pub fn handler<H>(self, handler: H) -> Tool
    where
        H: ToolHandler + 'static,
    {
        Tool {
            def: ToolDefinition {
                name: self.name,
                description: self.description,
                input_schema: self
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                annotations: self.annotations,
            },
            handler: Arc::new(handler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[tokio::test]
    async fn test_builder_and_call() {
        let tool = Tool::builder("add")
            .description("Add two integers")
            .input_schema(serde_json::json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }))
            .handler(|args: Value, _ctx| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(CallToolResult::text((a + b).to_string()))
            });

        assert_eq!(tool.name(), "add");
        assert!(tool.def.description.is_some());

        let ctx = RequestContext::new(RequestId::Number(1));
        let result = tool
            .handler()
            .call(serde_json::json!({"a": 2, "b": 3}), ctx)
            .await
            .unwrap();
        match &result.content[0] {
            crate::protocol::Content::Text { text } => assert_eq!(text, "5"),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[test]
    fn test_default_schema_is_object() {
        let tool =
            Tool::builder("noop").handler(|_args, _ctx| async { Ok(CallToolResult::text("ok")) });
        assert_eq!(tool.def.input_schema["type"], "object");
    }
}
