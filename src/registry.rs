//! C1: Tool Registry — the catalog of tools and their runtime-discovered
//! resource expansions.

use std::sync::Arc;

use dashmap::DashMap;

use crate::ir::{EffectType, ResourceAccess, Tool};

/// Holds tools by name, plus per-tool runtime-discovered resource overrides.
///
/// Registration is append-only; the override map only ever grows, via
/// [`ToolRegistry::expand_from_trace`]. Both maps are concurrent so a single
/// registry can be shared (via `Arc`) across an executor's worker tasks.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<Tool>>,
    resource_overrides: DashMap<String, Vec<ResourceAccess>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ToolRegistry {
            tools: DashMap::new(),
            resource_overrides: DashMap::new(),
        }
    }

    /// Register a tool under its own name, overwriting any prior registration
    /// of the same name. Registration itself is append-only in the sense that
    /// resource overrides accumulated under a name survive re-registration.
    pub fn register(&self, tool: Tool) {
        tracing::debug!(tool = %tool.name, "registering tool");
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).map(|e| e.value().clone())
    }

    /// The union of a tool's declared resources and any runtime-discovered overrides.
    pub fn infer_resources(&self, name: &str) -> Vec<ResourceAccess> {
        let mut resources = self
            .get(name)
            .map(|t| t.resources.clone())
            .unwrap_or_default();

        if let Some(overrides) = self.resource_overrides.get(name) {
            for access in overrides.value() {
                if !resources.contains(access) {
                    resources.push(access.clone());
                }
            }
        }
        resources
    }

    /// The strictly-stronger-or-equal of a tool's declared effect and its
    /// conservative default, under dominance. An unspecified effect always
    /// yields the conservative `(WRITE, EXTERNAL)` default.
    pub fn infer_effect(&self, name: &str) -> EffectType {
        match self.get(name).and_then(|t| t.effect) {
            Some(effect) => effect,
            None => EffectType::CONSERVATIVE,
        }
    }

    /// Record newly discovered resource accesses for `tool_name`, observed at
    /// runtime by the executor. Monotone: the override set only grows.
    /// Best-effort: never panics, so a malformed trace entry cannot abort execution.
    pub fn expand_from_trace(&self, tool_name: &str, accesses: Vec<ResourceAccess>) {
        if accesses.is_empty() {
            return;
        }
        let mut entry = self
            .resource_overrides
            .entry(tool_name.to_string())
            .or_default();
        for access in accesses {
            if !entry.contains(&access) {
                tracing::info!(tool = tool_name, resource = %access.resource, mode = ?access.mode, "discovered undeclared resource access");
                entry.push(access);
            }
        }
    }

    /// A conservative stand-in for `tool` when its effect is unspecified: a
    /// clone with effect forced to `(WRITE, EXTERNAL)`, requiring explicit
    /// downgrading by whoever declares the node.
    pub fn conservative_default(&self, name: &str) -> Option<EffectType> {
        self.get(name).map(|_| EffectType::CONSERVATIVE)
    }
}
