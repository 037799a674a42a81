//! Explicit registry of statically known tool handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::builtin::{EchoTool, ExecuteCommandTool, SleepTool, TimeTool};
use super::tool::{Tool, ToolDescriptor, ToolError};

/// Name → handler map. Registration order does not matter; descriptors are
/// reported sorted by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(ExecuteCommandTool::default()));
        registry.register(Arc::new(SleepTool));
        registry.register(Arc::new(TimeTool));
        registry
    }

    /// Add a tool, replacing any previous handler with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registry restricted to `names`. An empty selection keeps every tool.
    pub fn subset(&self, names: &[String]) -> Result<Self, ToolError> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        let mut selected = Self::new();
        for name in names {
            let tool = self
                .get(name)
                .ok_or_else(|| ToolError::NotFound(name.clone()))?;
            selected.register(tool);
        }
        Ok(selected)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["echo", "execute_command", "get_current_time", "sleep"]
        );
    }

    #[test]
    fn test_subset_selects_named_tools() {
        let registry = ToolRegistry::with_builtins();
        let subset = registry.subset(&["echo".to_string()]).unwrap();
        assert_eq!(subset.len(), 1);
        assert!(subset.contains("echo"));
        assert!(!subset.contains("sleep"));
    }

    #[test]
    fn test_subset_empty_keeps_all() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.subset(&[]).unwrap().len(), registry.len());
    }

    #[test]
    fn test_subset_unknown_tool_fails() {
        let registry = ToolRegistry::with_builtins();
        let err = registry.subset(&["browser".to_string()]).unwrap_err();
        assert_eq!(err, ToolError::NotFound("browser".to_string()));
    }

    #[test]
    fn test_descriptors_carry_schema() {
        let registry = ToolRegistry::with_builtins();
        let descriptors = registry.descriptors();
        let echo = descriptors.iter().find(|d| d.name == "echo").unwrap();
        assert!(echo.parameters.get("properties").is_some());
        assert!(!echo.description.is_empty());
    }
}
