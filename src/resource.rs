//! Resource definitions, templates, and handlers
//!
//! Concrete resources are addressed by exact URI. Template resources carry
//! `{param}` placeholders; a URI is matched against templates in insertion
//! order, placeholders capturing greedily left-to-right, and the first match
//! wins with its bound variables handed to the handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::protocol::{ReadResourceResult, ResourceDefinition, ResourceTemplateDefinition};
use crate::tool::HandlerFuture;

/// Handler invoked by `resources/read` for a concrete resource.
pub trait ResourceHandler: Send + Sync {
    fn read(&self, uri: String, ctx: RequestContext) -> HandlerFuture<ReadResourceResult>;
}

impl<F, Fut> ResourceHandler for F
where
    F: Fn(String, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::error::Result<ReadResourceResult>> + Send + 'static,
{
    fn read(&self, uri: String, ctx: RequestContext) -> HandlerFuture<ReadResourceResult> {
        Box::pin(self(uri, ctx))
    }
}

/// Handler invoked by `resources/read` for a template match; receives the
/// variables bound by the URI pattern.
pub trait ResourceTemplateHandler: Send + Sync {
    fn read(
        &self,
        uri: String,
        variables: HashMap<String, String>,
        ctx: RequestContext,
    ) -> HandlerFuture<ReadResourceResult>;
}

impl<F, Fut> ResourceTemplateHandler for F
where
    F: Fn(String, HashMap<String, String>, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::error::Result<ReadResourceResult>> + Send + 'static,
{
    fn read(
        &self,
        uri: String,
        variables: HashMap<String, String>,
        ctx: RequestContext,
    ) -> HandlerFuture<ReadResourceResult> {
        Box::pin(self(uri, variables, ctx))
    }
}

/// A registered concrete resource.
#[derive(Clone)]
pub struct Resource {
    pub def: ResourceDefinition,
    pub(crate) handler: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.def.uri)
            .field("name", &self.def.name)
            .finish_non_exhaustive()
    }
}

impl Resource {
    pub fn builder(uri: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder::new(uri)
    }

    pub fn uri(&self) -> &str {
        &self.def.uri
    }

    pub(crate) fn handler(&self) -> Arc<dyn ResourceHandler> {
        self.handler.clone()
    }
}

/// Builder for [`Resource`].
pub struct ResourceBuilder {
    uri: String,
    name: Option<String>,
    description: Option<String>,
    mime_type: Option<String>,
}

impl ResourceBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            description: None,
            mime_type: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn handler<H>(self, handler: H) -> Resource
    where
        H: ResourceHandler + 'static,
    {
        let name = self.name.unwrap_or_else(|| self.uri.clone());
        Resource {
            def: ResourceDefinition {
                uri: self.uri,
                name,
                description: self.description,
                mime_type: self.mime_type,
            },
            handler: Arc::new(handler),
        }
    }
}

/// A registered template resource with its compiled matcher.
#[derive(Clone)]
pub struct ResourceTemplate {
    pub def: ResourceTemplateDefinition,
    pattern: regex::Regex,
    variables: Vec<String>,
    pub(crate) handler: Arc<dyn ResourceTemplateHandler>,
}

impl std::fmt::Debug for ResourceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTemplate")
            .field("uri_template", &self.def.uri_template)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl ResourceTemplate {
    pub fn builder(uri_template: impl Into<String>) -> ResourceTemplateBuilder {
        ResourceTemplateBuilder::new(uri_template)
    }

    pub fn uri_template(&self) -> &str {
        &self.def.uri_template
    }

    /// Match a URI against this template, capturing placeholder bindings.
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, String>> {
        self.pattern.captures(uri).map(|caps| {
            self.variables
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    caps.get(i + 1)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect()
        })
    }

    pub(crate) fn handler(&self) -> Arc<dyn ResourceTemplateHandler> {
        self.handler.clone()
    }
}

/// Builder for [`ResourceTemplate`].
pub struct ResourceTemplateBuilder {
    uri_template: String,
    name: Option<String>,
    description: Option<String>,
    mime_type: Option<String>,
}

impl ResourceTemplateBuilder {
    pub fn new(uri_template: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: None,
            description: None,
            mime_type: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn handler<H>(self, handler: H) -> ResourceTemplate
    where
        H: ResourceTemplateHandler + 'static,
    {
        let (pattern, variables) = compile_uri_template(&self.uri_template);
        let name = self.name.unwrap_or_else(|| self.uri_template.clone());
        ResourceTemplate {
            def: ResourceTemplateDefinition {
                uri_template: self.uri_template,
                name,
                description: self.description,
                mime_type: self.mime_type,
            },
            pattern,
            variables,
            handler: Arc::new(handler),
        }
    }
}

/// Compile `{param}` placeholders into greedy capture groups, anchored at
/// both ends. Literal segments are escaped.
fn compile_uri_template(template: &str) -> (regex::Regex, Vec<String>) {
    let mut pattern = String::from("^");
    let mut variables = Vec::new();
    let mut literal = String::new();

    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            pattern.push_str(&regex::escape(&literal));
            literal.clear();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            variables.push(var_name);
            pattern.push_str("(.+)");
        } else {
            literal.push(c);
        }
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');

    let regex = regex::Regex::new(&pattern)
        .unwrap_or_else(|_| regex::Regex::new("$^").expect("fallback regex"));
    (regex, variables)
}
