//! Capability registry
//!
//! Mutation-safe, insertion-ordered collections of tools, resources
//! (concrete and template), and prompts. Dispatches take a read guard;
//! add/remove take a write guard, so removal is atomic and no half-listed
//! state is ever observable.
//!
//! Listings are cursor-paginated: the opaque cursor is the last returned
//! entry's name, and insertion order is preserved so pages stay stable.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::prompt::Prompt;
use crate::protocol::{
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
};
use crate::resource::{Resource, ResourceTemplate};
use crate::tool::Tool;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Insertion-ordered map keyed by entry name.
struct Ordered<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Ordered<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert, replacing in place when the name already exists (keeps the
    /// entry's position so paginated listings stay stable).
    fn insert(&mut self, name: String, entry: T) {
        match self.index.get(&name) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let Some(pos) = self.index.remove(name) else {
            return false;
        };
        self.entries.remove(pos);
        for idx in self.index.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        true
    }

    fn get(&self, name: &str) -> Option<&T> {
        self.index.get(name).map(|&pos| &self.entries[pos])
    }

    /// Page starting after `cursor`. An unknown cursor yields an empty page
    /// (entries may have been removed since it was issued).
    fn page(&self, cursor: Option<&str>, size: usize) -> (&[T], Option<usize>) {
        let start = match cursor {
            None => 0,
            Some(name) => match self.index.get(name) {
                Some(&pos) => pos + 1,
                None => return (&[], None),
            },
        };
        let end = (start + size).min(self.entries.len());
        let page = &self.entries[start..end];
        let next = (end < self.entries.len()).then_some(end.saturating_sub(1));
        (page, next)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The resolution of a `resources/read` URI.
pub enum ResolvedResource {
    Concrete(Resource),
    /// A template match with its bound variables.
    Template(ResourceTemplate, HashMap<String, String>),
}

/// Per-server capability collections.
pub struct Registry {
    tools: RwLock<Ordered<Tool>>,
    resources: RwLock<Ordered<Resource>>,
    templates: RwLock<Ordered<ResourceTemplate>>,
    prompts: RwLock<Ordered<Prompt>>,
    page_size: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl Registry {
    pub fn new(page_size: usize) -> Self {
        Self {
            tools: RwLock::new(Ordered::new()),
            resources: RwLock::new(Ordered::new()),
            templates: RwLock::new(Ordered::new()),
            prompts: RwLock::new(Ordered::new()),
            page_size: page_size.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    pub fn add_tool(&self, tool: Tool) {
        let mut tools = self.tools.write().expect("registry lock poisoned");
        tools.insert(tool.name().to_string(), tool);
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let mut tools = self.tools.write().expect("registry lock poisoned");
        tools.remove(name)
    }

    pub fn find_tool(&self, name: &str) -> Option<Tool> {
        let tools = self.tools.read().expect("registry lock poisoned");
        tools.get(name).cloned()
    }

    pub fn list_tools(&self, cursor: Option<&str>) -> ListToolsResult {
        let tools = self.tools.read().expect("registry lock poisoned");
        let (page, last) = tools.page(cursor, self.page_size);
        ListToolsResult {
            tools: page.iter().map(|t| t.def.clone()).collect(),
            next_cursor: last.map(|_| page.last().expect("non-empty page").name().to_string()),
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().expect("registry lock poisoned").len()
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    pub fn add_resource(&self, resource: Resource) {
        let mut resources = self.resources.write().expect("registry lock poisoned");
        resources.insert(resource.uri().to_string(), resource);
    }

    /// Remove a concrete resource by URI.
    pub fn remove_resource(&self, uri: &str) -> bool {
        let mut resources = self.resources.write().expect("registry lock poisoned");
        resources.remove(uri)
    }

    pub fn add_template(&self, template: ResourceTemplate) {
        let mut templates = self.templates.write().expect("registry lock poisoned");
        templates.insert(template.uri_template().to_string(), template);
    }

    pub fn remove_template(&self, uri_template: &str) -> bool {
        let mut templates = self.templates.write().expect("registry lock poisoned");
        templates.remove(uri_template)
    }

    /// Resolve a URI: concrete entries first, then templates in insertion
    /// order; the first matching template wins.
    pub fn find_resource(&self, uri: &str) -> Option<ResolvedResource> {
        {
            let resources = self.resources.read().expect("registry lock poisoned");
            if let Some(resource) = resources.get(uri) {
                return Some(ResolvedResource::Concrete(resource.clone()));
            }
        }
        let templates = self.templates.read().expect("registry lock poisoned");
        templates.entries.iter().find_map(|template| {
            template
                .match_uri(uri)
                .map(|vars| ResolvedResource::Template(template.clone(), vars))
        })
    }

    pub fn list_resources(&self, cursor: Option<&str>) -> ListResourcesResult {
        let resources = self.resources.read().expect("registry lock poisoned");
        let (page, last) = resources.page(cursor, self.page_size);
        ListResourcesResult {
            resources: page.iter().map(|r| r.def.clone()).collect(),
            next_cursor: last.map(|_| page.last().expect("non-empty page").uri().to_string()),
        }
    }

    pub fn list_templates(&self, cursor: Option<&str>) -> ListResourceTemplatesResult {
        let templates = self.templates.read().expect("registry lock poisoned");
        let (page, last) = templates.page(cursor, self.page_size);
        ListResourceTemplatesResult {
            resource_templates: page.iter().map(|t| t.def.clone()).collect(),
            next_cursor: last.map(|_| {
                page.last()
                    .expect("non-empty page")
                    .uri_template()
                    .to_string()
            }),
        }
    }

    // ------------------------------------------------------------------
    // Prompts
    // ------------------------------------------------------------------

    pub fn add_prompt(&self, prompt: Prompt) {
        let mut prompts = self.prompts.write().expect("registry lock poisoned");
        prompts.insert(prompt.name().to_string(), prompt);
    }

    pub fn remove_prompt(&self, name: &str) -> bool {
        let mut prompts = self.prompts.write().expect("registry lock poisoned");
        prompts.remove(name)
    }

    pub fn find_prompt(&self, name: &str) -> Option<Prompt> {
        let prompts = self.prompts.read().expect("registry lock poisoned");
        prompts.get(name).cloned()
    }

    pub fn list_prompts(&self, cursor: Option<&str>) -> ListPromptsResult {
        let prompts = self.prompts.read().expect("registry lock poisoned");
        let (page, last) = prompts.page(cursor, self.page_size);
        ListPromptsResult {
            prompts: page.iter().map(|p| p.def.clone()).collect(),
            next_cursor: last.map(|_| page.last().expect("non-empty page").name().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallToolResult, ReadResourceResult, ResourceContent};

    fn tool(name: &str) -> Tool {
        Tool::builder(name).handler(|_args, _ctx| async { Ok(CallToolResult::text("ok")) })
    }

    fn resource(uri: &str) -> Resource {
        Resource::builder(uri).handler(|uri: String, _ctx| async move {
            Ok(ReadResourceResult {
                contents: vec![ResourceContent::text(uri, "text/plain", "data")],
            })
        })
    }

    fn template(pattern: &str) -> ResourceTemplate {
        ResourceTemplate::builder(pattern).handler(
            |uri: String, _vars: HashMap<String, String>, _ctx| async move {
                Ok(ReadResourceResult {
                    contents: vec![ResourceContent::text(uri, "text/plain", "data")],
                })
            },
        )
    }

    #[test]
    fn test_insertion_order_preserved() {
        let registry = Registry::default();
        for name in ["alpha", "beta", "gamma"] {
            registry.add_tool(tool(name));
        }
        let listed = registry.list_tools(None);
        let names: Vec<_> = listed.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_add_then_remove_restores_listing() {
        let registry = Registry::default();
        registry.add_tool(tool("keep"));
        let before = registry.list_tools(None);

        registry.add_tool(tool("temp"));
        assert!(registry.remove_tool("temp"));

        let after = registry.list_tools(None);
        let names = |r: &ListToolsResult| {
            r.tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&before), names(&after));
    }

    #[test]
    fn test_replace_keeps_position() {
        let registry = Registry::default();
        registry.add_tool(tool("a"));
        registry.add_tool(tool("b"));
        registry.add_tool(tool("a")); // replace
        let listed = registry.list_tools(None);
        assert_eq!(listed.tools.len(), 2);
        assert_eq!(listed.tools[0].name, "a");
    }

    #[test]
    fn test_cursor_pagination_walks_all_entries() {
        let registry = Registry::new(2);
        for i in 0..5 {
            registry.add_tool(tool(&format!("tool-{i}")));
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = registry.list_tools(cursor.as_deref());
            seen.extend(page.tools.iter().map(|t| t.name.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(
            seen,
            vec!["tool-0", "tool-1", "tool-2", "tool-3", "tool-4"]
        );
    }

    #[test]
    fn test_unknown_cursor_yields_empty_page() {
        let registry = Registry::default();
        registry.add_tool(tool("only"));
        let page = registry.list_tools(Some("vanished"));
        assert!(page.tools.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_find_resource_prefers_concrete() {
        let registry = Registry::default();
        registry.add_template(template("users://{id}"));
        registry.add_resource(resource("users://me"));

        match registry.find_resource("users://me") {
            Some(ResolvedResource::Concrete(r)) => assert_eq!(r.uri(), "users://me"),
            _ => panic!("expected the concrete entry to win"),
        }
        match registry.find_resource("users://42") {
            Some(ResolvedResource::Template(t, vars)) => {
                assert_eq!(t.uri_template(), "users://{id}");
                assert_eq!(vars.get("id").map(String::as_str), Some("42"));
            }
            _ => panic!("expected a template match"),
        }
    }

    #[test]
    fn test_first_matching_template_wins() {
        let registry = Registry::default();
        registry.add_template(template("data://{a}"));
        registry.add_template(template("data://{b}"));
        match registry.find_resource("data://x") {
            Some(ResolvedResource::Template(t, _)) => {
                assert_eq!(t.uri_template(), "data://{a}");
            }
            _ => panic!("expected a template match"),
        }
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let registry = Registry::default();
        assert!(!registry.remove_tool("ghost"));
        assert!(!registry.remove_prompt("ghost"));
        assert!(!registry.remove_resource("ghost://x"));
    }
}
