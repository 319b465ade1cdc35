use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::agent::{Agent, AgentEvent};
use crate::context::{ContextId, ContextSigner};
use crate::error::Result;
use crate::factory::AgentDirectory;
use crate::memory::ConversationMemory;
use crate::message::Message;
use crate::storage::ConversationStore;

/// Result of one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub agent_id: String,
    pub context_id: String,
    pub reply: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
}

impl AgentSummary {
    fn of(agent: &Agent) -> Self {
        Self {
            id: agent.id().to_string(),
            name: agent.name().to_string(),
            description: agent.description().to_string(),
            tools: agent
                .tool_descriptions()
                .into_iter()
                .map(|tool| tool.name)
                .collect(),
        }
    }
}

/// Multi-turn conversations on top of stateless agents.
///
/// Only the user message and the final reply of a turn are persisted; tool
/// traffic stays inside the turn that produced it.
#[derive(Clone)]
pub struct ChatService {
    agents: AgentDirectory,
    store: Arc<dyn ConversationStore>,
    signer: ContextSigner,
}

impl ChatService {
    pub fn new(
        agents: AgentDirectory,
        store: Arc<dyn ConversationStore>,
        signer: ContextSigner,
    ) -> Self {
        Self {
            agents,
            store,
            signer,
        }
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.agents
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(|agent| AgentSummary::of(agent)).collect()
    }

    pub fn agent(&self, agent_id: &str) -> Result<Arc<Agent>> {
        self.agents.require(agent_id)
    }

    /// Validate `token` for `agent_id`, or issue a new context when absent.
    pub fn resolve_context(&self, agent_id: &str, token: Option<&str>) -> Result<ContextId> {
        self.agents.require(agent_id)?;
        self.signer.resolve(agent_id, token)
    }

    pub async fn chat(
        &self,
        agent_id: &str,
        message: &str,
        context: Option<&str>,
    ) -> Result<ChatTurn> {
        let context = self.resolve_context(agent_id, context)?;
        self.run_turn(&context, message, None).await
    }

    /// Like [`ChatService::chat`] for an already resolved context, reporting
    /// progress on `events`.
    pub async fn chat_streaming(
        &self,
        context: &ContextId,
        message: &str,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<ChatTurn> {
        self.run_turn(context, message, Some(events)).await
    }

    pub async fn history(&self, agent_id: &str, context: &str) -> Result<Vec<Message>> {
        self.agents.require(agent_id)?;
        let context = self.signer.validate(agent_id, context)?;
        self.store.load(&context.storage_key()).await
    }

    pub async fn clear(&self, agent_id: &str, context: &str) -> Result<()> {
        self.agents.require(agent_id)?;
        let context = self.signer.validate(agent_id, context)?;
        self.store.clear(&context.storage_key()).await
    }

    async fn run_turn(
        &self,
        context: &ContextId,
        message: &str,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<ChatTurn> {
        let agent = self.agents.require(&context.agent_id)?;
        let key = context.storage_key();
        let mut memory = ConversationMemory::with_messages(self.store.load(&key).await?);
        let start = memory.len();

        let reply = match events {
            Some(events) => agent.respond_streaming(&mut memory, message, events).await?,
            None => agent.respond(&mut memory, message).await?,
        };

        let transcript: Vec<Message> = memory
            .since(start)
            .iter()
            .filter(|message| message.is_transcript())
            .cloned()
            .collect();
        self.store.append(&key, &transcript).await?;
        tracing::info!(agent = %context.agent_id, thread = %context.thread, "chat turn completed");

        Ok(ChatTurn {
            agent_id: context.agent_id.clone(),
            context_id: context.token.clone(),
            reply,
        })
    }
}
