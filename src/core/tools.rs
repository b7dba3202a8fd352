//! Shared library registry handed to every controller.
//!
//! Tools are the only sanctioned way for controllers to reach infrastructure
//! beyond their own request. Each tool exposes named operations taking and
//! returning JSON values so that compiled and interpreted controllers share
//! the same surface.
use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ToolError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Tool '{tool}' has no operation '{operation}'")]
    UnknownOperation { tool: String, operation: String },

    #[error("Invalid arguments for '{tool}.{operation}': {message}")]
    InvalidArguments {
        tool: String,
        operation: String,
        message: String,
    },

    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

pub trait Tool: Send + Sync {
    fn invoke(&self, operation: &str, args: &[Value]) -> Result<Value, ToolError>;
}

/// A read-only value published from the `[tools]` section of the server
/// configuration.
///
/// Operations:
/// * `get()` returns the whole value
/// * `lookup(pointer)` resolves a JSON pointer such as `/db/host`
#[derive(Debug, Clone)]
pub struct ConfiguredTool {
    name: String,
    value: Value,
}

impl ConfiguredTool {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Tool for ConfiguredTool {
    fn invoke(&self, operation: &str, args: &[Value]) -> Result<Value, ToolError> {
        match operation {
            "get" => Ok(self.value.clone()),
            "lookup" => {
                let pointer = args.first().and_then(Value::as_str).ok_or_else(|| {
                    ToolError::InvalidArguments {
                        tool: self.name.clone(),
                        operation: operation.to_string(),
                        message: "expected a JSON pointer string".to_string(),
                    }
                })?;
                self.value
                    .pointer(pointer)
                    .cloned()
                    .ok_or_else(|| ToolError::Failed {
                        tool: self.name.clone(),
                        message: format!("nothing at '{pointer}'"),
                    })
            }
            _ => Err(ToolError::UnknownOperation {
                tool: self.name.clone(),
                operation: operation.to_string(),
            }),
        }
    }
}

/// Name → tool map. Built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ConfiguredTool`] per configured entry.
    pub fn from_config(entries: &HashMap<String, Value>) -> Self {
        let mut registry = Self::new();
        for (name, value) in entries {
            registry.register(name.clone(), Arc::new(ConfiguredTool::new(name, value.clone())));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.insert(name.into(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn invoke(&self, name: &str, operation: &str, args: &[Value]) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.invoke(operation, args)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> ToolRegistry {
        let mut config = HashMap::new();
        config.insert(
            "catalog".to_string(),
            json!({ "db": { "host": "localhost", "port": 5432 } }),
        );
        ToolRegistry::from_config(&config)
    }

    #[test]
    fn test_configured_tool_operations() {
        let tools = registry();
        assert_eq!(tools.names(), vec!["catalog"]);
        assert_eq!(
            tools.invoke("catalog", "lookup", &[json!("/db/port")]).unwrap(),
            json!(5432)
        );
        assert_eq!(
            tools.invoke("catalog", "get", &[]).unwrap()["db"]["host"],
            json!("localhost")
        );
    }

    #[test]
    fn test_tool_errors() {
        let tools = registry();
        assert!(matches!(
            tools.invoke("missing", "get", &[]),
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            tools.invoke("catalog", "drop", &[]),
            Err(ToolError::UnknownOperation { .. })
        ));
        assert!(matches!(
            tools.invoke("catalog", "lookup", &[json!(1)]),
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            tools.invoke("catalog", "lookup", &[json!("/nope")]),
            Err(ToolError::Failed { .. })
        ));
    }
}
