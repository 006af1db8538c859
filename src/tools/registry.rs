//! Tool registry for SpeakMCP core
//!
//! Holds the descriptors of every tool exposed by connected providers, keyed
//! by fully-qualified name. Lookup understands `provider:tool` names and falls
//! back to bare tool names across providers.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::types::{split_qualified_name, ToolDescriptor};

/// Registry of provider tools.
///
/// # Example
///
/// ```
/// use speakmcp_core::tools::{ToolDescriptor, ToolRegistry};
/// use serde_json::json;
///
/// let mut registry = ToolRegistry::new();
/// registry.register(ToolDescriptor::new("files", "read", "Read a file", json!({})));
///
/// assert!(registry.has("files:read"));
/// assert_eq!(registry.resolve("read").unwrap().name, "files:read");
/// ```
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// Names are unique per provider prefix: a second tool with the same
    /// fully-qualified name is ignored and `false` is returned.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> bool {
        if self.tools.contains_key(&descriptor.name) {
            warn!(tool = %descriptor.name, "Duplicate tool name, keeping the first registration");
            return false;
        }
        debug!(tool = %descriptor.name, "Registering tool");
        self.tools.insert(descriptor.name.clone(), descriptor);
        true
    }

    /// Register every tool of one provider, replacing what it had before.
    pub fn register_provider(&mut self, provider: &str, descriptors: Vec<ToolDescriptor>) -> usize {
        self.unregister_provider(provider);
        let mut count = 0;
        for descriptor in descriptors {
            if self.register(descriptor) {
                count += 1;
            }
        }
        info!(provider = %provider, tools = count, "Registered provider tools");
        count
    }

    /// Remove every tool of one provider. Returns how many were removed.
    pub fn unregister_provider(&mut self, provider: &str) -> usize {
        let before = self.tools.len();
        self.tools.retain(|_, d| d.provider != provider);
        before - self.tools.len()
    }

    pub fn clear(&mut self) {
        self.tools.clear();
    }

    /// Exact lookup by fully-qualified name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Resolve a name as the decision maker wrote it.
    ///
    /// Exact `provider:tool` matches win. Otherwise the part after an unknown
    /// prefix (or the whole name, if unprefixed) is looked up as a bare tool
    /// name across all providers; the first provider in name order wins.
    pub fn resolve(&self, name: &str) -> Option<&ToolDescriptor> {
        if let Some(found) = self.tools.get(name) {
            return Some(found);
        }

        let bare = match split_qualified_name(name) {
            Some((prefix, rest)) if !self.has_provider(prefix) => rest,
            Some(_) => return None,
            None => name,
        };

        let mut matches = self.tools.values().filter(|d| d.tool_name == bare);
        let first = matches.next()?;
        if matches.next().is_some() {
            debug!(
                requested = %name,
                resolved = %first.name,
                "Bare tool name matches several providers"
            );
        }
        Some(first)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.tools.values().any(|d| d.provider == provider)
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().cloned().collect()
    }

    pub fn provider_tools(&self, provider: &str) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .filter(|d| d.provider == provider)
            .cloned()
            .collect()
    }

    /// Get all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
