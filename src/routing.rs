//! Agents exposed as tools, so a coordinator's model picks specialists from
//! their descriptions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::Agent;
use crate::error::Result;
use crate::llm::LanguageModel;
use crate::tool::{required_str, Tool};

pub struct AgentTool {
    agent: Arc<Agent>,
    name: String,
    description: String,
}

impl AgentTool {
    pub fn new(agent: Arc<Agent>) -> Self {
        let name = format!("ask_{}", agent.id());
        let description = if agent.description().is_empty() {
            format!("Delegate the request to {}.", agent.name())
        } else {
            agent.description().to_string()
        };
        Self {
            agent,
            name,
            description,
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The request to forward, with every detail the specialist needs."
                }
            },
            "required": ["query"],
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let query = required_str(&input, &self.name, "query")?;
        tracing::info!(specialist = %self.agent.id(), "routing request");
        let reply = self.agent.ask(query).await?;
        Ok(json!({ "agent": self.agent.id(), "reply": reply }))
    }
}

/// A triage agent that can reach every specialist through an `ask_{id}` tool.
pub fn coordinator(
    id: impl Into<String>,
    model: Arc<dyn LanguageModel>,
    instructions: impl Into<String>,
    specialists: &[Arc<Agent>],
) -> Agent {
    specialists.iter().fold(
        Agent::new(id, model).with_instructions(instructions),
        |agent, specialist| agent.with_tool(Arc::new(AgentTool::new(specialist.clone()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StubModel;

    #[tokio::test]
    async fn coordinator_delegates_through_the_specialist_tool() {
        let specialist_model = StubModel::new(vec!["Votre colis arrive demain.".into()]);
        let billing = Arc::new(
            Agent::new("billing", StubModel::new(vec![]))
                .with_description("Questions de facturation et de paiement."),
        );
        let delivery = Arc::new(
            Agent::new("delivery", specialist_model.clone())
                .with_description("Suivi des livraisons et colis."),
        );
        let triage_model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"ask_delivery","arguments":{"query":"où est mon colis ?"}}"#.into(),
            r#"{"action":"respond","content":"Votre colis arrive demain."}"#.into(),
        ]);
        let triage = coordinator(
            "triage",
            triage_model.clone(),
            "Oriente la demande vers le bon spécialiste.",
            &[billing, delivery],
        );

        let reply = triage.ask("où est mon colis ?").await.unwrap();

        assert_eq!(reply, "Votre colis arrive demain.");
        let first = &triage_model.requests()[0];
        assert_eq!(first.tools, vec!["ask_billing", "ask_delivery"]);
        assert_eq!(specialist_model.requests()[0].messages[1].content, "où est mon colis ?");
    }

    #[test]
    fn description_comes_from_the_agent() {
        let agent = Arc::new(Agent::new("faq", StubModel::new(vec![])).with_description("FAQ"));
        let tool = AgentTool::new(agent);
        assert_eq!(tool.name(), "ask_faq");
        assert_eq!(tool.description(), "FAQ");

        let unnamed = AgentTool::new(Arc::new(Agent::new("misc", StubModel::new(vec![]))));
        assert_eq!(unnamed.description(), "Delegate the request to misc.");
    }
}
