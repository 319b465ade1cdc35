use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::knowledge::Retriever;
use crate::tool::{required_str, Tool};

/// Retrieval over the policy/FAQ sections.
pub struct PolicySearchTool {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl PolicySearchTool {
    pub fn new(retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        Self {
            retriever,
            top_k: top_k.max(1),
        }
    }
}

#[async_trait]
impl Tool for PolicySearchTool {
    fn name(&self) -> &str {
        "search_policies"
    }

    fn description(&self) -> &str {
        "Search the company policies and FAQ. Returns the most relevant sections with their titles."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for."}
            },
            "required": ["query"],
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let query = required_str(&input, self.name(), "query")?;
        let hits = self.retriever.retrieve(query, self.top_k).await?;
        let sections: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "id": hit.document.id,
                    "title": hit.document.metadata.get("title").cloned().unwrap_or(Value::Null),
                    "text": hit.document.text,
                    "score": hit.score,
                })
            })
            .collect();
        Ok(json!({ "query": query, "sections": sections }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{HashingEmbedder, InMemoryVectorStore, KnowledgeBase, PolicySection};

    #[tokio::test]
    async fn returns_matching_sections() {
        let kb = KnowledgeBase::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::default()),
        );
        kb.ingest_sections(vec![PolicySection {
            document_id: "faq".into(),
            section_id: "garantie".into(),
            title: "Garantie".into(),
            content: "Tous nos produits sont garantis deux ans.".into(),
        }])
        .await
        .unwrap();

        let tool = PolicySearchTool::new(Arc::new(kb), 2);
        let output = tool.call(json!({"query": "garantie produits"})).await.unwrap();

        assert_eq!(output["sections"][0]["id"], "faq#garantie");
        assert_eq!(output["sections"][0]["title"], "Garantie");
        assert!(tool.call(json!({})).await.is_err());
    }
}
