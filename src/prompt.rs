//! Prompt definitions and handlers
//!
//! A prompt is a parameterized message-template generator: `prompts/get`
//! hands the handler the caller's arguments and receives back a sequence of
//! [`PromptMessage`]s.
//!
//! [`PromptMessage`]: crate::protocol::PromptMessage

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::protocol::{GetPromptResult, PromptArgument, PromptDefinition};
use crate::tool::HandlerFuture;

/// Handler invoked by `prompts/get`.
pub trait PromptHandler: Send + Sync {
    fn get(
        &self,
        arguments: HashMap<String, String>,
        ctx: RequestContext,
    ) -> HandlerFuture<GetPromptResult>;
}

impl<F, Fut> PromptHandler for F
where
    F: Fn(HashMap<String, String>, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::error::Result<GetPromptResult>> + Send + 'static,
{
    fn get(
        &self,
        arguments: HashMap<String, String>,
        ctx: RequestContext,
    ) -> HandlerFuture<GetPromptResult> {
        Box::pin(self(arguments, ctx))
    }
}

/// A registered prompt: definition plus handler.
#[derive(Clone)]
pub struct Prompt {
    pub def: PromptDefinition,
    pub(crate) handler: Arc<dyn PromptHandler>,
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.def.name)
            .finish_non_exhaustive()
    }
}

impl Prompt {
    pub fn builder(name: impl Into<String>) -> PromptBuilder {
        PromptBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub(crate) fn handler(&self) -> Arc<dyn PromptHandler> {
        self.handler.clone()
    }
}

/// Builder for [`Prompt`].
pub struct PromptBuilder {
    name: String,
    description: Option<String>,
    arguments: Vec<PromptArgument>,
}

impl PromptBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an argument in the prompt's schema.
    pub fn argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: Some(description.into()),
            required,
        });
        self
    }

    pub fn handler<H>(self, handler: H) -> Prompt
    where
        H: PromptHandler + 'static,
    {
        Prompt {
            def: PromptDefinition {
                name: self.name,
                description: self.description,
                arguments: self.arguments,
            },
            handler: Arc::new(handler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PromptMessage, RequestId};

    #[tokio::test]
    async fn test_builder_and_get() {
        let prompt = Prompt::builder("greet")
            .description("Greet a person by name")
            .argument("name", "Who to greet", true)
            .handler(|args: HashMap<String, String>, _ctx| async move {
                let name = args.get("name").cloned().unwrap_or_else(|| "you".into());
                Ok(GetPromptResult {
                    description: None,
                    messages: vec![PromptMessage::user(format!("Say hello to {name}."))],
                })
            });

        assert_eq!(prompt.name(), "greet");
        assert_eq!(prompt.def.arguments.len(), 1);
        assert!(prompt.def.arguments[0].required);

        let mut args = HashMap::new();
        args.insert("name".to_string(), "Ada".to_string());
        let ctx = RequestContext::new(RequestId::Number(1));
        let result = prompt.handler().get(args, ctx).await.unwrap();
        assert_eq!(result.messages.len(), 1);
    }
}
