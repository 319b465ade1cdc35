use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{LabError, Result};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Option<Value> {
        None
    }
    async fn call(&self, input: Value) -> Result<Value>;
}

/// What the model is told about a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.tools
            .values()
            .map(|tool| ToolDescription {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| LabError::ToolNotFound(name.to_string()))?;
        tool.call(input).await.map_err(|source| match source {
            LabError::ToolInvocation { .. } => source,
            other => LabError::ToolInvocation {
                name: name.to_string(),
                source: Box::new(other),
            },
        })
    }
}

type ToolFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// A plain function exposed to the model with its description metadata.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Option<Value>,
    func: Arc<ToolFn>,
}

impl FunctionTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            func: Arc::new(func),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        self.parameters.clone()
    }

    async fn call(&self, input: Value) -> Result<Value> {
        (self.func)(input)
    }
}

/// Fetch a required string argument.
pub(crate) fn required_str<'a>(input: &'a Value, tool: &str, field: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| LabError::Protocol(format!("missing `{field}` for {tool}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upper() -> FunctionTool {
        FunctionTool::new("upper", "Uppercases `text`", |input| {
            let text = required_str(&input, "upper", "text")?;
            Ok(json!({ "text": text.to_uppercase() }))
        })
        .with_parameters(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        }))
    }

    #[tokio::test]
    async fn calls_function_tools_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(upper());

        let output = registry.call("upper", json!({"text": "colis"})).await.unwrap();
        assert_eq!(output, json!({"text": "COLIS"}));
        assert_eq!(registry.describe()[0].description, "Uppercases `text`");
    }

    #[tokio::test]
    async fn wraps_tool_failures_with_the_tool_name() {
        let mut registry = ToolRegistry::new();
        registry.register(upper());

        let err = registry.call("upper", json!({})).await.unwrap_err();
        assert!(matches!(err, LabError::ToolInvocation { ref name, .. } if name == "upper"));
        assert!(matches!(
            registry.call("missing", json!({})).await,
            Err(LabError::ToolNotFound(_))
        ));
    }

    #[test]
    fn registry_debug_lists_tool_names() {
        let mut registry = ToolRegistry::new();
        registry.register(upper());
        assert_eq!(format!("{registry:?}"), r#"{"upper"}"#);
    }
}
