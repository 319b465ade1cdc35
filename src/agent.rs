use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{LabError, Result};
use crate::hooks::{AgentHook, ConfirmationHandler};
use crate::llm::{ChatOptions, LanguageModel, ModelCompletion, ResponseFormat};
use crate::memory::{ConversationMemory, FullMemoryStrategy, MemoryStrategy, WindowedMemoryStrategy};
use crate::message::{Message, ToolCall};
use crate::tool::{Tool, ToolDescription, ToolRegistry};

/// Progress reported while an agent works on a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Delta { content: String },
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, output: Value },
    ApprovalRejected { name: String },
}

/// A configured wrapper around a chat-completion call: instructions, tools
/// and options. Conversation state lives outside the agent.
pub struct Agent {
    id: String,
    name: String,
    description: String,
    instructions: String,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    options: ChatOptions,
    max_steps: usize,
    history: Arc<dyn MemoryStrategy>,
    gated_tools: HashSet<String>,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    hooks: Vec<Arc<dyn AgentHook>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            instructions: "You are a helpful agent.".to_string(),
            model,
            tools: ToolRegistry::new(),
            options: ChatOptions::default(),
            max_steps: 8,
            history: Arc::new(FullMemoryStrategy),
            gated_tools: HashSet::new(),
            confirmation_handler: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register_arc(tool);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.options.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    /// Constrain final replies to a JSON schema.
    pub fn with_response_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.options.response_format = Some(ResponseFormat {
            name: name.into(),
            schema,
            strict: true,
        });
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history = Arc::new(WindowedMemoryStrategy::new(window));
        self
    }

    /// Gate a tool behind the confirmation handler.
    pub fn require_approval(mut self, tool: impl Into<String>) -> Self {
        self.gated_tools.insert(tool.into());
        self
    }

    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn tool_descriptions(&self) -> Vec<ToolDescription> {
        self.tools.describe()
    }

    /// Run one user turn against `memory`. Returns the final assistant reply.
    pub async fn respond(
        &self,
        memory: &mut ConversationMemory,
        user_input: impl Into<String>,
    ) -> Result<String> {
        self.run(memory, user_input.into(), None).await
    }

    /// Like [`Agent::respond`], reporting deltas and tool activity on `events`.
    pub async fn respond_streaming(
        &self,
        memory: &mut ConversationMemory,
        user_input: impl Into<String>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        self.run(memory, user_input.into(), Some(events)).await
    }

    /// Run a turn and decode the reply with the configured response schema.
    pub async fn respond_structured<T: DeserializeOwned>(
        &self,
        memory: &mut ConversationMemory,
        user_input: impl Into<String>,
    ) -> Result<T> {
        if self.options.response_format.is_none() {
            return Err(LabError::Protocol(format!(
                "agent `{}` has no response schema",
                self.id
            )));
        }
        let reply = self.respond(memory, user_input).await?;
        serde_json::from_str(&reply).map_err(|err| {
            LabError::Protocol(format!(
                "agent `{}` reply does not match its schema: {err}",
                self.id
            ))
        })
    }

    /// Stateless single exchange.
    pub async fn ask(&self, user_input: impl Into<String>) -> Result<String> {
        let mut memory = ConversationMemory::default();
        self.respond(&mut memory, user_input).await
    }

    async fn run(
        &self,
        memory: &mut ConversationMemory,
        user_input: String,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<String> {
        memory.push(Message::user(user_input));
        let tools = self.tools.describe();

        for step in 0..self.max_steps {
            let request = self.build_request(memory);
            for hook in &self.hooks {
                hook.before_model(&self.id, &request).await?;
            }
            let completion = match events {
                Some(events) => self.stream_step(&request, &tools, events).await?,
                None => {
                    self.model
                        .complete_chat(&request, &tools, &self.options)
                        .await?
                }
            };
            for hook in &self.hooks {
                hook.after_model(&self.id, completion.content.as_deref())
                    .await?;
            }

            if !completion.tool_calls.is_empty() {
                for (index, mut call) in completion.tool_calls.into_iter().enumerate() {
                    if call.id.is_none() {
                        call.id = Some(format!("call-{step}-{index}"));
                    }
                    self.execute_tool(memory, call, events).await?;
                }
                continue;
            }

            return match completion.content {
                Some(content) => {
                    memory.push(Message::assistant(&content));
                    Ok(content)
                }
                None => Err(LabError::Protocol(
                    "Model response missing content and tool calls".into(),
                )),
            };
        }

        Err(LabError::Protocol(format!(
            "agent `{}` reached the step limit without returning a response",
            self.id
        )))
    }

    fn build_request(&self, memory: &ConversationMemory) -> Vec<Message> {
        let mut request = vec![Message::system(&self.instructions)];
        request.extend(self.history.get_context_messages(memory.messages()));
        request
    }

    async fn stream_step(
        &self,
        request: &[Message],
        tools: &[ToolDescription],
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<ModelCompletion> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let produce = async move {
            // `tx` is moved in so the forwarder ends once the model is done.
            let tx = tx;
            self.model
                .stream_chat(request, tools, &self.options, &tx)
                .await
        };
        let forward = async {
            while let Some(content) = rx.recv().await {
                let _ = events.send(AgentEvent::Delta { content }).await;
            }
        };
        let (completion, ()) = tokio::join!(produce, forward);
        completion
    }

    async fn execute_tool(
        &self,
        memory: &mut ConversationMemory,
        call: ToolCall,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<()> {
        memory.push(Message::tool_call(call.clone()));
        emit(
            events,
            AgentEvent::ToolCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        )
        .await;
        for hook in &self.hooks {
            hook.before_tool_call(&self.id, &call).await?;
        }

        let output = if self.gated_tools.contains(&call.name) && !self.approve(&call).await? {
            tracing::info!(agent = %self.id, tool = %call.name, "tool call rejected");
            emit(
                events,
                AgentEvent::ApprovalRejected {
                    name: call.name.clone(),
                },
            )
            .await;
            json!({ "error": format!("the call to `{}` was rejected by the operator", call.name) })
        } else {
            self.tools.call(&call.name, call.arguments.clone()).await?
        };

        let result = Message::tool(&call.name, output.clone(), call.id.clone());
        if let Some(tool_result) = &result.tool_result {
            for hook in &self.hooks {
                hook.after_tool_result(&self.id, tool_result).await?;
            }
        }
        memory.push(result);
        emit(
            events,
            AgentEvent::ToolResult {
                name: call.name,
                output,
            },
        )
        .await;
        Ok(())
    }

    async fn approve(&self, call: &ToolCall) -> Result<bool> {
        match &self.confirmation_handler {
            Some(handler) => handler.confirm_tool_call(&self.id, call).await,
            None => {
                tracing::warn!(agent = %self.id, tool = %call.name, "no approval handler; rejecting");
                Ok(false)
            }
        }
    }
}

async fn emit(events: Option<&mpsc::Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(events) = events {
        let _ = events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::StaticApproval;
    use crate::message::Role;
    use crate::tool::FunctionTool;
    use crate::StubModel;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            "echo",
            "Echoes the `text` field back",
            |input| Ok(input),
        ))
    }

    #[tokio::test]
    async fn returns_llm_response_without_tools() {
        let model = StubModel::new(vec![r#"{"action":"respond","content":"Hello!"}"#.into()]);
        let agent = Agent::new("greeter", model);
        let mut memory = ConversationMemory::default();

        let reply = agent.respond(&mut memory, "hi").await.unwrap();

        assert_eq!(reply, "Hello!");
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn executes_tool_then_replies() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{"text":"ping"}}"#.into(),
            r#"{"action":"respond","content":"Echoed your request."}"#.into(),
        ]);
        let agent = Agent::new("echoer", model.clone()).with_tool(echo_tool());
        let mut memory = ConversationMemory::default();

        let reply = agent.respond(&mut memory, "say ping").await.unwrap();

        assert_eq!(reply, "Echoed your request.");
        assert_eq!(memory.len(), 4);
        assert_eq!(memory.messages()[2].role, Role::Tool);
        let second = &model.requests()[1];
        assert_eq!(second.tools, vec!["echo".to_string()]);
        assert_eq!(
            second.messages[2].tool_call.as_ref().unwrap().id.as_deref(),
            Some("call-0-0")
        );
    }

    #[tokio::test]
    async fn sends_instructions_and_options() {
        let model = StubModel::new(vec!["ok".into()]);
        let agent = Agent::new("support", model.clone())
            .with_instructions("Réponds en français.")
            .with_temperature(0.1)
            .with_max_tokens(300);

        agent.ask("bonjour").await.unwrap();

        let request = &model.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, "Réponds en français.");
        assert_eq!(request.options.temperature, Some(0.1));
        assert_eq!(request.options.max_tokens, Some(300));
    }

    #[tokio::test]
    async fn rejected_tool_call_is_reported_to_the_model() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{"text":"x"}}"#.into(),
            r#"{"action":"respond","content":"Je ne peux pas."}"#.into(),
        ]);
        let agent = Agent::new("gated", model)
            .with_tool(echo_tool())
            .require_approval("echo")
            .with_confirmation_handler(Arc::new(StaticApproval(false)));
        let (tx, mut rx) = mpsc::channel(16);
        let mut memory = ConversationMemory::default();

        let reply = agent
            .respond_streaming(&mut memory, "go", &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(reply, "Je ne peux pas.");
        let output = &memory.messages()[2].tool_result.as_ref().unwrap().output;
        assert!(output["error"].as_str().unwrap().contains("rejected"));

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert!(seen.contains(&AgentEvent::ApprovalRejected { name: "echo".into() }));
        assert_eq!(
            seen.last(),
            Some(&AgentEvent::Delta {
                content: "Je ne peux pas.".into()
            })
        );
    }

    #[tokio::test]
    async fn gated_tool_without_handler_fails_closed() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{"text":"x"}}"#.into(),
            "refusé".into(),
        ]);
        let agent = Agent::new("gated", model)
            .with_tool(echo_tool())
            .require_approval("echo");
        let mut memory = ConversationMemory::default();

        agent.respond(&mut memory, "go").await.unwrap();

        let output = &memory.messages()[2].tool_result.as_ref().unwrap().output;
        assert!(output.get("error").is_some());
    }

    #[tokio::test]
    async fn decodes_structured_replies() {
        #[derive(serde::Deserialize)]
        struct Ticket {
            typology: String,
            urgent: bool,
        }

        let model = StubModel::new(vec![r#"{"typology":"delivery","urgent":true}"#.into()]);
        let agent = Agent::new("triage", model.clone())
            .with_response_schema("ticket", json!({"type": "object"}));
        let mut memory = ConversationMemory::default();

        let ticket: Ticket = agent
            .respond_structured(&mut memory, "colis perdu")
            .await
            .unwrap();

        assert_eq!(ticket.typology, "delivery");
        assert!(ticket.urgent);
        assert!(model.requests()[0].options.response_format.is_some());
    }

    #[tokio::test]
    async fn structured_reply_requires_a_schema() {
        let agent = Agent::new("plain", StubModel::new(vec![]));
        let mut memory = ConversationMemory::default();
        let result: Result<Value> = agent.respond_structured(&mut memory, "x").await;
        assert!(matches!(result, Err(LabError::Protocol(_))));
    }

    #[tokio::test]
    async fn stops_at_the_step_limit() {
        let call = r#"{"action":"call_tool","name":"echo","arguments":{}}"#.to_string();
        let model = StubModel::new(vec![call.clone(), call]);
        let agent = Agent::new("looping", model)
            .with_tool(echo_tool())
            .with_max_steps(2);

        let err = agent.ask("loop").await.unwrap_err();
        assert!(err.to_string().contains("step limit"));
    }
}
