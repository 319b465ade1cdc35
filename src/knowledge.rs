//! Retrieval over the policy/FAQ corpus.

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::{ModelConfig, ModelProvider};
use crate::error::{LabError, Result};
use crate::llm::{azure_url, http_client};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// One section of a policy or FAQ document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    pub document_id: String,
    pub section_id: String,
    pub title: String,
    pub content: String,
}

impl PolicySection {
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }

    pub fn into_document(self) -> Document {
        Document {
            id: format!("{}#{}", self.document_id, self.section_id),
            text: self.embedding_text(),
            metadata: json!({
                "document_id": self.document_id,
                "section_id": self.section_id,
                "title": self.title,
            }),
        }
    }
}

/// Read a JSON array of [`PolicySection`] rows.
pub async fn load_sections(path: impl AsRef<Path>) -> Result<Vec<PolicySection>> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await.map_err(|err| {
        LabError::Config(format!(
            "failed to read knowledge sections `{}`: {err}",
            path.as_ref().display()
        ))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, document: Document, embedding: Vec<f32>) -> Result<()>;
    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<ScoredDocument>>;
}

/// Deterministic bag-of-words embedding, usable offline.
pub struct HashingEmbedder {
    buckets: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { buckets: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; self.buckets];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.buckets;
            vector[idx] += 1.0;
        }

        Ok(vector)
    }
}

/// Embeddings from an Azure OpenAI deployment or an OpenAI-compatible API.
pub struct OpenAIEmbedder {
    http: reqwest::Client,
    url: String,
    header: (&'static str, String),
    model: Option<String>,
}

impl OpenAIEmbedder {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let deployment = cfg.embedding_deployment.as_deref().ok_or_else(|| {
            LabError::Config("missing embedding_deployment in [model] configuration".into())
        })?;
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| LabError::Config("missing api_key in [model] configuration".into()))?;
        let http = http_client(cfg)?;
        match cfg.provider {
            ModelProvider::Azure => {
                let endpoint = cfg.endpoint.as_deref().ok_or_else(|| {
                    LabError::Config("missing endpoint in [model] configuration".into())
                })?;
                Ok(Self {
                    http,
                    url: azure_url(endpoint, deployment, "embeddings", &cfg.api_version),
                    header: ("api-key", api_key),
                    model: None,
                })
            }
            ModelProvider::OpenAi => {
                let base = cfg
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                Ok(Self {
                    http,
                    url: format!("{}/embeddings", base.trim_end_matches('/')),
                    header: ("authorization", format!("Bearer {api_key}")),
                    model: Some(deployment.to_string()),
                })
            }
            ModelProvider::Stub => Err(LabError::Config(
                "the stub provider has no embeddings endpoint".into(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut payload = json!({ "input": text });
        if let (Some(model), Some(body)) = (&self.model, payload.as_object_mut()) {
            body.insert("model".into(), json!(model));
        }
        let resp = self
            .http
            .post(&self.url)
            .header(self.header.0, &self.header.1)
            .json(&payload)
            .send()
            .await
            .map_err(|err| LabError::LanguageModel(format!("embedding request error: {err}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LabError::LanguageModel(format!(
                "embedding request failed with {status}: {body}"
            )));
        }
        let body: EmbeddingResponse = resp.json().await.map_err(|err| {
            LabError::LanguageModel(format!("embedding response parse error: {err}"))
        })?;
        body.data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| LabError::LanguageModel("embedding response was empty".into()))
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, document: Document, embedding: Vec<f32>) -> Result<()> {
        self.entries.write().await.push((document, embedding));
        Ok(())
    }

    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<ScoredDocument>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .map(|(doc, stored)| ScoredDocument {
                document: doc.clone(),
                score: cosine_similarity(stored, &embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub struct KnowledgeBase {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl KnowledgeBase {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub async fn add_document(&self, document: Document) -> Result<()> {
        let embedding = self.embedder.embed(&document.text).await?;
        self.store.add(document, embedding).await
    }

    pub async fn ingest_sections(&self, sections: Vec<PolicySection>) -> Result<usize> {
        let count = sections.len();
        for section in sections {
            self.add_document(section.into_document()).await?;
        }
        tracing::info!(sections = count, "indexed policy sections");
        Ok(count)
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDocument>> {
        let embedding = self.embedder.embed(query).await?;
        self.store.search(embedding, top_k).await
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDocument>>;
}

#[async_trait]
impl Retriever for KnowledgeBase {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDocument>> {
        self.search(query, top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sections() -> Vec<PolicySection> {
        vec![
            PolicySection {
                document_id: "cgv".into(),
                section_id: "retours".into(),
                title: "Retours et remboursements".into(),
                content: "Vous disposez de 30 jours pour retourner un article.".into(),
            },
            PolicySection {
                document_id: "cgv".into(),
                section_id: "livraison".into(),
                title: "Livraison".into(),
                content: "La livraison standard prend 3 à 5 jours ouvrés.".into(),
            },
        ]
    }

    #[tokio::test]
    async fn retrieves_the_closest_section() {
        let kb = KnowledgeBase::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::default()),
        );
        kb.ingest_sections(sections()).await.unwrap();

        let hits = kb.retrieve("combien de jours pour la livraison", 1).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "cgv#livraison");
        assert_eq!(hits[0].document.metadata["title"], "Livraison");
    }

    #[test]
    fn embedding_text_joins_title_and_content() {
        let section = &sections()[1];
        assert!(section.embedding_text().starts_with("Livraison\n\n"));
    }

    #[tokio::test]
    async fn loads_sections_from_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&sections()).unwrap()).unwrap();
        let loaded = load_sections(file.path()).await.unwrap();
        assert_eq!(loaded, sections());
    }
}
