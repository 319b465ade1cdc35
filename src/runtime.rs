//! Wires a parsed [`AppConfig`] into running agents, storage and workflows.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{AppConfig, ModelProvider, WorkflowMode};
use crate::context::ContextSigner;
use crate::error::{LabError, Result};
use crate::factory::AgentFactory;
use crate::hooks::ConfirmationHandler;
use crate::knowledge::{
    load_sections, Embedder, HashingEmbedder, InMemoryVectorStore, KnowledgeBase, OpenAIEmbedder,
    Retriever,
};
use crate::llm::LanguageModel;
use crate::service::ChatService;
use crate::storage::{open_store, ConversationStore};
use crate::toolkit::default_catalog;
use crate::workflow::{Workflow, WorkflowEvent};

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub mode: WorkflowMode,
    pub agents: Vec<String>,
}

pub struct RuntimeBuilder {
    config: AppConfig,
    model: Option<Arc<dyn LanguageModel>>,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl RuntimeBuilder {
    /// Serve every agent from `model` instead of the configured endpoint.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<LabRuntime> {
        let config = self.config;
        if config.model.provider == ModelProvider::Stub && self.model.is_none() {
            return Err(LabError::Config(
                "the stub provider needs a model supplied with `with_model`".into(),
            ));
        }

        let retriever = match &config.knowledge.sections_path {
            Some(path) => {
                let embedder: Arc<dyn Embedder> =
                    match (&config.model.embedding_deployment, &self.model) {
                        (Some(_), None) => Arc::new(OpenAIEmbedder::from_config(&config.model)?),
                        _ => Arc::new(HashingEmbedder::default()),
                    };
                let knowledge =
                    KnowledgeBase::new(embedder, Arc::new(InMemoryVectorStore::default()));
                knowledge.ingest_sections(load_sections(path).await?).await?;
                Some(Arc::new(knowledge) as Arc<dyn Retriever>)
            }
            None => None,
        };

        let mut factory = AgentFactory::new(
            config.model.clone(),
            default_catalog(retriever, config.knowledge.top_k),
        );
        if let Some(model) = self.model {
            factory = factory.with_model(model);
        }
        if let Some(handler) = self.confirmation_handler {
            factory = factory.with_confirmation_handler(handler);
        }
        let agents = factory.build_all(&config.agents)?;

        let (events, _) = broadcast::channel(128);
        let workflows = config
            .workflows
            .iter()
            .map(|cfg| {
                Workflow::from_config(cfg, &agents)
                    .map(|flow| (cfg.name.clone(), flow.with_event_sender(events.clone())))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.storage).await?,
        };
        let signer = ContextSigner::from_config(&config.security)?;

        tracing::info!(
            agents = agents.len(),
            workflows = workflows.len(),
            storage = ?config.storage.backend,
            "runtime ready"
        );
        Ok(LabRuntime {
            chat: ChatService::new(agents, store, signer),
            workflows,
            events,
            config,
        })
    }
}

/// Everything a front end (HTTP, A2A, console) needs.
pub struct LabRuntime {
    config: AppConfig,
    chat: ChatService,
    workflows: BTreeMap<String, Workflow>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl LabRuntime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            model: None,
            confirmation_handler: None,
            store: None,
        }
    }

    pub async fn from_config(config: AppConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn workflow(&self, name: &str) -> Result<&Workflow> {
        self.workflows
            .get(name)
            .ok_or_else(|| LabError::WorkflowNotFound(name.to_string()))
    }

    pub fn workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .values()
            .map(|flow| WorkflowSummary {
                name: flow.name().to_string(),
                mode: flow.mode(),
                agents: flow.agent_ids(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StubModel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
        [model]
        provider = "stub"
        deployment = "stub"

        [[agents]]
        id = "faq"
        description = "Répond aux questions sur les politiques."
        instructions = "Cherche dans les politiques avant de répondre."
        tools = ["search_policies"]

        [[agents]]
        id = "triage"
        instructions = "Oriente."
        handoffs = ["faq"]

        [[workflows]]
        name = "pipeline"
        mode = "sequential"
        agents = ["triage", "faq"]
    "#;

    fn with_sections(raw: &str, sections: &NamedTempFile) -> AppConfig {
        let mut cfg = AppConfig::parse(raw).unwrap();
        cfg.knowledge.sections_path = Some(sections.path().to_string_lossy().into_owned());
        cfg
    }

    #[tokio::test]
    async fn wires_agents_knowledge_and_workflows() {
        let mut sections = NamedTempFile::new().unwrap();
        write!(
            sections,
            r#"[{{"document_id":"faq","section_id":"retours","title":"Retours","content":"30 jours."}}]"#
        )
        .unwrap();
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"search_policies","arguments":{"query":"retours"}}"#
                .into(),
            "Vous avez 30 jours.".into(),
        ]);

        let runtime = LabRuntime::builder(with_sections(CONFIG, &sections))
            .with_model(model)
            .build()
            .await
            .unwrap();

        let turn = runtime.chat().chat("faq", "retours ?", None).await.unwrap();
        assert_eq!(turn.reply, "Vous avez 30 jours.");
        assert_eq!(runtime.workflows()[0].agents, vec!["triage", "faq"]);
        assert!(matches!(
            runtime.workflow("missing"),
            Err(LabError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn search_tool_needs_a_corpus() {
        let cfg = AppConfig::parse(CONFIG).unwrap();
        let result = LabRuntime::builder(cfg)
            .with_model(StubModel::new(vec![]))
            .build()
            .await;
        assert!(matches!(result, Err(LabError::ToolNotFound(name)) if name == "search_policies"));
    }

    #[tokio::test]
    async fn stub_provider_requires_an_injected_model() {
        let cfg = AppConfig::parse(CONFIG).unwrap();
        assert!(LabRuntime::from_config(cfg).await.is_err());
    }
}
