use std::collections::HashMap;
use std::sync::Arc;
use crate::tools::Tool;

/// Named table of capabilities available to a run.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Lane-scoped copy holding only the named tools. Unknown names are
    /// returned so the caller can reject the configuration.
    pub fn subset(&self, names: &[String]) -> Result<ToolRegistry, Vec<String>> {
        let mut scoped = ToolRegistry::new();
        let mut missing = Vec::new();
        for name in names {
            match self.tools.get(name) {
                Some(tool) => {
                    scoped.tools.insert(name.clone(), Arc::clone(tool));
                }
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(scoped)
        } else {
            Err(missing)
        }
    }

    /// Tool schemas in OpenAI function format, ordered by name.
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.list()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.schema()
                    }
                })
            })
            .collect()
    }
}
