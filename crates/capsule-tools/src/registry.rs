//! Tool registry: runtime lookup from dotted tool names to
//! implementations.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    fs::{FsReadTool, FsWriteTool},
    http::HttpGetTool,
    shell::ShellRunTool,
    Tool,
};

/// Maps tool names to implementations. Read-only at run time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name replaces the previous
    /// implementation (useful for mocks in tests).
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Argument descriptors for every registered tool, in the shape
    /// planners consume.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "args": tool.schema(),
                })
            })
            .collect()
    }
}

/// A registry with the four built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(FsReadTool));
    registry.register(Box::new(FsWriteTool));
    registry.register(Box::new(HttpGetTool));
    registry.register(Box::new(ShellRunTool));
    registry
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_the_four_builtins() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["fs.read", "fs.write", "http.get", "shell.run"]);
        assert!(registry.get("fs.read").is_some());
        assert!(registry.get("fs.delete").is_none());
    }

    #[test]
    fn schemas_carry_name_description_and_args() {
        let registry = default_registry();
        let schemas = registry.schemas();
        assert_eq!(schemas.len(), 4);
        for schema in &schemas {
            assert!(schema["name"].is_string());
            assert!(schema["description"].is_string());
            assert!(schema["args"].is_object());
        }
    }
}
