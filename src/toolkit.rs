use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{LabError, Result};
use crate::knowledge::Retriever;
use crate::tool::{Tool, ToolRegistry};
use crate::tools::{ClassifyProblemTool, CurrentTimeTool, FormulateMessageTool, PolicySearchTool};

/// Tools that agent configurations may reference by name.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Registry holding the named tools, failing on the first unknown name.
    pub fn select(&self, names: &[String]) -> Result<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for name in names {
            let tool = self
                .get(name)
                .ok_or_else(|| LabError::ToolNotFound(name.clone()))?;
            registry.register_arc(tool);
        }
        Ok(registry)
    }
}

/// The built-in tools. `search_policies` is only present when a retriever
/// is available.
pub fn default_catalog(retriever: Option<Arc<dyn Retriever>>, top_k: usize) -> ToolCatalog {
    let mut catalog = ToolCatalog::new();
    catalog.register(ClassifyProblemTool);
    catalog.register(FormulateMessageTool);
    catalog.register(CurrentTimeTool);
    if let Some(retriever) = retriever {
        catalog.register(PolicySearchTool::new(retriever, top_k));
    }
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_without_retriever() {
        let catalog = default_catalog(None, 3);
        assert_eq!(
            catalog.names(),
            vec!["classify_problem", "current_time", "formulate_message"]
        );
    }

    #[test]
    fn select_rejects_unknown_tools() {
        let catalog = default_catalog(None, 3);
        let registry = catalog.select(&["current_time".to_string()]).unwrap();
        assert!(registry.contains("current_time"));

        let err = catalog.select(&["web_search".to_string()]).unwrap_err();
        assert!(matches!(err, LabError::ToolNotFound(name) if name == "web_search"));
    }
}
