use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::Agent;
use crate::config::{WorkflowConfig, WorkflowMode};
use crate::error::{LabError, Result};
use crate::factory::AgentDirectory;

/// Lifecycle notifications, broadcast to `/events` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started { workflow: String },
    StepCompleted { workflow: String, agent: String },
    Completed { workflow: String },
    Failed { workflow: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutput {
    pub agent: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow: String,
    pub mode: WorkflowMode,
    pub output: String,
    pub steps: Vec<StepOutput>,
}

/// A fixed group of agents run either as a pipeline or as a fan-out.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    mode: WorkflowMode,
    agents: Vec<Arc<Agent>>,
    events: Option<broadcast::Sender<WorkflowEvent>>,
}

impl Workflow {
    /// Each agent receives the previous agent's reply.
    pub fn sequential(name: impl Into<String>, agents: Vec<Arc<Agent>>) -> Self {
        Self::new(name, WorkflowMode::Sequential, agents)
    }

    /// Every agent receives the same input at once.
    pub fn concurrent(name: impl Into<String>, agents: Vec<Arc<Agent>>) -> Self {
        Self::new(name, WorkflowMode::Concurrent, agents)
    }

    fn new(name: impl Into<String>, mode: WorkflowMode, agents: Vec<Arc<Agent>>) -> Self {
        Self {
            name: name.into(),
            mode,
            agents,
            events: None,
        }
    }

    pub fn from_config(cfg: &WorkflowConfig, agents: &AgentDirectory) -> Result<Self> {
        let members = cfg
            .agents
            .iter()
            .map(|id| agents.require(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(&cfg.name, cfg.mode, members))
    }

    pub fn with_event_sender(mut self, events: broadcast::Sender<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> WorkflowMode {
        self.mode
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|agent| agent.id().to_string()).collect()
    }

    pub async fn run(&self, input: impl Into<String>) -> Result<WorkflowOutcome> {
        if self.agents.is_empty() {
            return Err(LabError::Protocol(format!(
                "workflow `{}` has no agents",
                self.name
            )));
        }
        let input = input.into();
        tracing::info!(workflow = %self.name, mode = ?self.mode, "workflow started");
        self.emit(WorkflowEvent::Started {
            workflow: self.name.clone(),
        });

        let result = match self.mode {
            WorkflowMode::Sequential => self.run_sequential(input).await,
            WorkflowMode::Concurrent => self.run_concurrent(input).await,
        };

        match &result {
            Ok(_) => self.emit(WorkflowEvent::Completed {
                workflow: self.name.clone(),
            }),
            Err(err) => {
                tracing::warn!(workflow = %self.name, error = %err, "workflow failed");
                self.emit(WorkflowEvent::Failed {
                    workflow: self.name.clone(),
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn run_sequential(&self, input: String) -> Result<WorkflowOutcome> {
        let mut current = input;
        let mut steps = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            current = agent.ask(current).await?;
            self.step_done(agent);
            steps.push(StepOutput {
                agent: agent.id().to_string(),
                output: current.clone(),
            });
        }
        Ok(WorkflowOutcome {
            workflow: self.name.clone(),
            mode: self.mode,
            output: current,
            steps,
        })
    }

    async fn run_concurrent(&self, input: String) -> Result<WorkflowOutcome> {
        let replies = try_join_all(self.agents.iter().map(|agent| {
            let input = input.clone();
            async move {
                let reply = agent.ask(input).await?;
                self.step_done(agent);
                Ok::<_, LabError>(reply)
            }
        }))
        .await?;

        let output = self
            .agents
            .iter()
            .zip(&replies)
            .map(|(agent, reply)| format!("[{}]\n{reply}", agent.name()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let steps = self
            .agents
            .iter()
            .zip(replies)
            .map(|(agent, output)| StepOutput {
                agent: agent.id().to_string(),
                output,
            })
            .collect();
        Ok(WorkflowOutcome {
            workflow: self.name.clone(),
            mode: self.mode,
            output,
            steps,
        })
    }

    fn step_done(&self, agent: &Agent) {
        tracing::debug!(workflow = %self.name, agent = %agent.id(), "workflow step completed");
        self.emit(WorkflowEvent::StepCompleted {
            workflow: self.name.clone(),
            agent: agent.id().to_string(),
        });
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StubModel;

    fn agent(id: &str, replies: &[&str]) -> (Arc<Agent>, Arc<StubModel>) {
        let model = StubModel::new(replies.iter().map(|r| r.to_string()).collect());
        (Arc::new(Agent::new(id, model.clone())), model)
    }

    #[tokio::test]
    async fn sequential_pipes_each_reply_into_the_next_agent() {
        let (classifier, _) = agent("classifier", &["delivery"]);
        let (writer, writer_model) = agent("writer", &["Bonjour, votre colis arrive."]);
        let (tx, mut rx) = broadcast::channel(16);
        let flow = Workflow::sequential("reply", vec![classifier, writer]).with_event_sender(tx);

        let outcome = flow.run("colis en retard").await.unwrap();

        assert_eq!(outcome.output, "Bonjour, votre colis arrive.");
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(writer_model.requests()[0].messages[1].content, "delivery");
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkflowEvent::Started {
                workflow: "reply".into()
            }
        );
    }

    #[tokio::test]
    async fn concurrent_joins_outputs_in_declaration_order() {
        let (fr, fr_model) = agent("fr", &["Bonjour"]);
        let (en, _) = agent("en", &["Hello"]);
        let flow = Workflow::concurrent("translate", vec![fr, en]);

        let outcome = flow.run("hi").await.unwrap();

        assert_eq!(outcome.output, "[fr]\nBonjour\n\n[en]\nHello");
        assert_eq!(fr_model.requests()[0].messages[1].content, "hi");
        assert_eq!(outcome.steps[1].agent, "en");
    }

    #[tokio::test]
    async fn a_failing_member_fails_the_run() {
        let (ok, _) = agent("ok", &["fine"]);
        let (broken, _) = agent("broken", &[]);
        let (tx, mut rx) = broadcast::channel(16);
        let flow = Workflow::concurrent("fanout", vec![ok, broken]).with_event_sender(tx);

        assert!(flow.run("x").await.is_err());

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            failed |= matches!(event, WorkflowEvent::Failed { .. });
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn from_config_requires_known_agents() {
        let (a, _) = agent("a", &[]);
        let mut directory = AgentDirectory::default();
        directory.insert(a);
        let cfg = WorkflowConfig {
            name: "wf".into(),
            mode: WorkflowMode::Sequential,
            agents: vec!["a".into(), "missing".into()],
        };
        assert!(matches!(
            Workflow::from_config(&cfg, &directory),
            Err(LabError::AgentNotFound(_))
        ));
        assert!(Workflow::sequential("empty", vec![]).run("x").await.is_err());
    }
}
