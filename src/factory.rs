//! Turns declarative [`AgentConfig`]s into runnable agents.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::agent::Agent;
use crate::config::{AgentConfig, ModelConfig};
use crate::error::{LabError, Result};
use crate::hooks::{ConfirmationHandler, TracingHook};
use crate::llm::{LanguageModel, OpenAIClient};
use crate::routing::AgentTool;
use crate::toolkit::ToolCatalog;

/// Built agents by id.
#[derive(Clone, Default)]
pub struct AgentDirectory {
    agents: BTreeMap<String, Arc<Agent>>,
}

impl AgentDirectory {
    pub fn insert(&mut self, agent: Arc<Agent>) {
        self.agents.insert(agent.id().to_string(), agent);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<Agent>> {
        self.get(id)
            .ok_or_else(|| LabError::AgentNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Agent>> + '_ {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

pub struct AgentFactory {
    model: ModelConfig,
    catalog: ToolCatalog,
    clients: Mutex<HashMap<String, Arc<dyn LanguageModel>>>,
    model_override: Option<Arc<dyn LanguageModel>>,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
}

impl AgentFactory {
    pub fn new(model: ModelConfig, catalog: ToolCatalog) -> Self {
        Self {
            model,
            catalog,
            clients: Mutex::new(HashMap::new()),
            model_override: None,
            confirmation_handler: None,
        }
    }

    /// Use one model for every agent instead of building chat clients.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model_override = Some(model);
        self
    }

    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    fn client_for(&self, deployment: &str) -> Result<Arc<dyn LanguageModel>> {
        if let Some(model) = &self.model_override {
            return Ok(model.clone());
        }
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| LabError::Config("chat client cache poisoned".into()))?;
        if let Some(client) = clients.get(deployment) {
            return Ok(client.clone());
        }
        let client: Arc<dyn LanguageModel> =
            Arc::new(OpenAIClient::from_config(&self.model, deployment)?);
        clients.insert(deployment.to_string(), client.clone());
        Ok(client)
    }

    /// Build one agent. Every handoff must already be in `built`.
    pub fn build(&self, cfg: &AgentConfig, built: &AgentDirectory) -> Result<Agent> {
        let deployment = cfg
            .deployment
            .as_deref()
            .unwrap_or(&self.model.deployment);
        let mut tools = self.catalog.select(&cfg.tools)?;
        for handoff in &cfg.handoffs {
            tools.register(AgentTool::new(built.require(handoff)?));
        }
        for gated in &cfg.requires_approval {
            if !tools.contains(gated) {
                return Err(LabError::Config(format!(
                    "agent `{}` gates `{gated}`, which is not one of its tools",
                    cfg.id
                )));
            }
        }

        let mut agent = Agent::new(&cfg.id, self.client_for(deployment)?)
            .with_name(cfg.display_name())
            .with_description(&cfg.description)
            .with_instructions(&cfg.instructions)
            .with_tools(tools)
            .with_max_steps(cfg.max_steps)
            .with_hook(Arc::new(TracingHook));
        if let Some(temperature) = cfg.temperature {
            agent = agent.with_temperature(temperature);
        }
        if let Some(top_p) = cfg.top_p {
            agent = agent.with_top_p(top_p);
        }
        if let Some(max_tokens) = cfg.max_tokens {
            agent = agent.with_max_tokens(max_tokens);
        }
        if let Some(schema) = &cfg.response_schema {
            agent = agent.with_response_schema(format!("{}_reply", cfg.id), schema.clone());
        }
        if let Some(window) = cfg.history_window {
            agent = agent.with_history_window(window);
        }
        for gated in &cfg.requires_approval {
            agent = agent.require_approval(gated);
        }
        if let Some(handler) = &self.confirmation_handler {
            agent = agent.with_confirmation_handler(handler.clone());
        }
        Ok(agent)
    }

    /// Build every agent, specialists before the agents that hand off to them.
    pub fn build_all(&self, configs: &[AgentConfig]) -> Result<AgentDirectory> {
        let by_id: HashMap<&str, &AgentConfig> =
            configs.iter().map(|cfg| (cfg.id.as_str(), cfg)).collect();
        let mut order = Vec::with_capacity(configs.len());
        let mut marks = HashMap::new();
        for cfg in configs {
            visit(&cfg.id, &by_id, &mut marks, &mut order)?;
        }

        let mut directory = AgentDirectory::default();
        for id in order {
            let agent = self.build(by_id[id], &directory)?;
            tracing::debug!(agent = id, "built agent");
            directory.insert(Arc::new(agent));
        }
        Ok(directory)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a AgentConfig>,
    marks: &mut HashMap<&'a str, Mark>,
    order: &mut Vec<&'a str>,
) -> Result<()> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(LabError::Config(format!(
                "handoff cycle involving agent `{id}`"
            )))
        }
        None => {}
    }
    let cfg: &'a AgentConfig = by_id
        .get(id)
        .copied()
        .ok_or_else(|| LabError::AgentNotFound(id.to_string()))?;
    marks.insert(id, Mark::Visiting);
    for handoff in &cfg.handoffs {
        visit(handoff, by_id, marks, order)?;
    }
    marks.insert(id, Mark::Done);
    order.push(id);
    Ok(())
}
