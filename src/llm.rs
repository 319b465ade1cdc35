//! Chat-completion clients and the abstraction agents talk to.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::config::{ModelConfig, ModelProvider};
use crate::error::{LabError, Result};
use crate::message::{Message, Role, ToolCall};
use crate::tool::ToolDescription;

/// Structured-output contract sent as `response_format: json_schema`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

/// Sampling and output options for a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
}

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
    ) -> Result<ModelCompletion>;

    /// Same as `complete_chat` but forwards text deltas as they arrive.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
        deltas: &mpsc::Sender<String>,
    ) -> Result<ModelCompletion> {
        let completion = self.complete_chat(messages, tools, options).await?;
        if let Some(content) = &completion.content {
            let _ = deltas.send(content.clone()).await;
        }
        Ok(completion)
    }
}

fn coalesce_error(status: reqwest::StatusCode, body: &str) -> LabError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return LabError::LanguageModel(format!("rate limit exceeded: {body}"));
    }
    LabError::LanguageModel(format!("request failed with {status}: {body}"))
}

fn serialize_tool_arguments(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| args.to_string())
}

fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[derive(Debug, Clone)]
enum Auth {
    /// Azure `api-key` header.
    ApiKey(String),
    Bearer(String),
}

/// Client for Azure OpenAI deployments and OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    url: String,
    auth: Auth,
    /// Sent as `model` for OpenAI-compatible endpoints; Azure routes by URL.
    model: Option<String>,
}

impl OpenAIClient {
    /// Build a client for `deployment` using the shared model settings.
    pub fn from_config(cfg: &ModelConfig, deployment: &str) -> Result<Self> {
        let http = http_client(cfg)?;
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            LabError::Config("missing api_key in [model] configuration".into())
        })?;
        match cfg.provider {
            ModelProvider::Azure => {
                let endpoint = cfg.endpoint.as_deref().ok_or_else(|| {
                    LabError::Config("missing endpoint in [model] configuration".into())
                })?;
                Ok(Self {
                    http,
                    url: azure_url(endpoint, deployment, "chat/completions", &cfg.api_version),
                    auth: Auth::ApiKey(api_key),
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
                    url: format!("{}/chat/completions", base.trim_end_matches('/')),
                    auth: Auth::Bearer(api_key),
                    model: Some(deployment.to_string()),
                })
            }
            ModelProvider::Stub => Err(LabError::Config(
                "the stub provider has no HTTP client".into(),
            )),
        }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let builder = self.http.post(&self.url);
        match &self.auth {
            Auth::ApiKey(key) => builder.header("api-key", key),
            Auth::Bearer(key) => builder.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {key}"),
            ),
        }
    }

    fn payload(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
        stream: bool,
    ) -> Value {
        let mut body = Map::new();
        body.insert("messages".into(), json!(to_openai_messages(messages)));
        body.insert("stream".into(), json!(stream));
        if let Some(model) = &self.model {
            body.insert("model".into(), json!(model));
        }
        if let Some(tools) = to_openai_tools(tools) {
            body.insert("tools".into(), json!(tools));
            body.insert("tool_choice".into(), json!("auto"));
        }
        if let Some(temperature) = options.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = options.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = options.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(format) = &options.response_format {
            body.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": format.name,
                        "schema": format.schema,
                        "strict": format.strict,
                    }
                }),
            );
        }
        Value::Object(body)
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response> {
        let resp = self
            .request()
            .json(payload)
            .send()
            .await
            .map_err(|err| LabError::LanguageModel(format!("chat request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body));
        }
        Ok(resp)
    }
}

pub(crate) fn http_client(cfg: &ModelConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .build()
        .map_err(|err| LabError::LanguageModel(format!("http client error: {err}")))
}

pub(crate) fn azure_url(endpoint: &str, deployment: &str, operation: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/{operation}?api-version={api_version}",
        endpoint.trim_end_matches('/'),
        urlencoding::encode(deployment),
    )
}

fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            }
            .to_string();

            let tool_calls = message.tool_call.as_ref().map(|call| {
                vec![OpenAiToolCall {
                    id: call.id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: serialize_tool_arguments(&call.arguments),
                    },
                }]
            });

            let content = match (&message.tool_result, &message.tool_call) {
                (Some(result), _) => Some(serialize_tool_arguments(&result.output)),
                (None, Some(_)) => None,
                (None, None) => Some(message.content.clone()),
            };

            OpenAiMessage {
                role,
                content,
                tool_call_id: message
                    .tool_result
                    .as_ref()
                    .and_then(|result| result.tool_call_id.clone()),
                tool_calls,
            }
        })
        .collect()
}

fn to_openai_tools(tools: &[ToolDescription]) -> Option<Vec<OpenAiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| OpenAiTool {
                r#type: "function".to_string(),
                function: OpenAiFunction {
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
    )
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
    ) -> Result<ModelCompletion> {
        let payload = self.payload(messages, tools, options, false);
        let resp = self.send(&payload).await?;

        let body: OpenAiResponse = resp.json().await.map_err(|err| {
            LabError::LanguageModel(format!("chat response parse error: {err}"))
        })?;
        let first = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LabError::LanguageModel("model returned no choices".into()))?;

        let tool_calls = first
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_tool_arguments(&call.function.arguments),
            })
            .collect();

        Ok(ModelCompletion {
            content: first.message.content,
            tool_calls,
        })
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
        deltas: &mpsc::Sender<String>,
    ) -> Result<ModelCompletion> {
        let payload = self.payload(messages, tools, options, true);
        let resp = self.send(&payload).await?;

        let mut content = String::new();
        let mut calls: BTreeMap<usize, ToolCallState> = BTreeMap::new();
        // Bytes, not text: a chunk may end inside a multi-byte character.
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| LabError::LanguageModel(format!("chat stream error: {err}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw);
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
                    LabError::LanguageModel(format!("chat stream parse error `{data}`: {err}"))
                })?;
                for choice in parsed.choices {
                    if let Some(delta) = choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            let _ = deltas.send(delta).await;
                        }
                    }
                    for delta_call in choice.delta.tool_calls.unwrap_or_default() {
                        let state = calls.entry(delta_call.index).or_default();
                        if let Some(id) = delta_call.id {
                            state.id = Some(id);
                        }
                        if let Some(function) = delta_call.function {
                            if let Some(name) = function.name {
                                state.name = Some(name);
                            }
                            if let Some(args) = function.arguments {
                                state.arguments.push_str(&args);
                            }
                        }
                    }
                }
            }
        }

        let tool_calls = calls
            .into_values()
            .filter_map(|state| {
                let name = state.name?;
                Some(ToolCall {
                    id: state.id,
                    name,
                    arguments: parse_tool_arguments(&state.arguments),
                })
            })
            .collect();

        Ok(ModelCompletion {
            content: (!content.is_empty()).then_some(content),
            tool_calls,
        })
    }
}

/// A request seen by [`StubModel`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub options: ChatOptions,
}

/// A deterministic model used for tests and demos.
///
/// Each scripted entry is either `{"action":"respond","content":...}`,
/// `{"action":"call_tool","name":...,"arguments":...}` or raw reply text.
#[derive(Default)]
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut locked) = self.responses.lock() {
            locked.push_back(response.into());
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|locked| locked.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &ChatOptions,
    ) -> Result<ModelCompletion> {
        if let Ok(mut recorded) = self.requests.lock() {
            recorded.push(RecordedRequest {
                messages: messages.to_vec(),
                tools: tools.iter().map(|tool| tool.name.clone()).collect(),
                options: options.clone(),
            });
        }
        let raw = self
            .responses
            .lock()
            .map_err(|_| LabError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                LabError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => Ok(ModelCompletion {
                content: Some(content),
                tool_calls: Vec::new(),
            }),
            Ok(StubDirective::CallTool { name, arguments }) => Ok(ModelCompletion {
                content: None,
                tool_calls: vec![ToolCall {
                    id: None,
                    name,
                    arguments,
                }],
            }),
            Err(_) => Ok(ModelCompletion {
                content: Some(raw),
                tool_calls: Vec::new(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiDeltaChoice>,
}

/// Azure interleaves content-filter annotations that carry no `delta`.
#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn azure_config() -> ModelConfig {
        ModelConfig {
            provider: ModelProvider::Azure,
            endpoint: Some("https://labs.openai.azure.com/".into()),
            deployment: "gpt-4o-mini".into(),
            api_key: Some("key".into()),
            api_version: "2024-10-21".into(),
            embedding_deployment: None,
            timeout_secs: 5,
        }
    }

    #[test]
    fn azure_url_targets_deployment() {
        let client = OpenAIClient::from_config(&azure_config(), "gpt-4o").unwrap();
        assert_eq!(
            client.url,
            "https://labs.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
        );
        assert!(client.model.is_none());
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let mut cfg = azure_config();
        cfg.api_key = None;
        assert!(matches!(
            OpenAIClient::from_config(&cfg, "gpt-4o"),
            Err(LabError::Config(_))
        ));
    }

    #[test]
    fn payload_maps_options_and_tools() {
        let mut cfg = azure_config();
        cfg.provider = ModelProvider::OpenAi;
        cfg.endpoint = None;
        let client = OpenAIClient::from_config(&cfg, "gpt-4o").unwrap();
        let options = ChatOptions {
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(256),
            response_format: Some(ResponseFormat {
                name: "ticket".into(),
                schema: json!({"type": "object"}),
                strict: true,
            }),
        };
        let tools = vec![ToolDescription {
            name: "current_time".into(),
            description: "Returns the time".into(),
            parameters: None,
        }];
        let payload = client.payload(&[Message::user("hi")], &tools, &options, false);

        assert_eq!(payload["model"], "gpt-4o");
        assert_eq!(payload["max_tokens"], 256);
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["tools"][0]["function"]["name"], "current_time");
        assert_eq!(payload["response_format"]["json_schema"]["name"], "ticket");
        assert!(payload.get("top_p").is_none());
    }

    #[test]
    fn tool_messages_carry_call_ids() {
        let call = ToolCall {
            id: Some("call_1".into()),
            name: "current_time".into(),
            arguments: json!({}),
        };
        let mapped = to_openai_messages(&[
            Message::tool_call(call),
            Message::tool("current_time", json!({"utc": "now"}), Some("call_1".into())),
        ]);
        assert!(mapped[0].content.is_none());
        assert_eq!(mapped[0].tool_calls.as_ref().unwrap()[0].function.arguments, "{}");
        assert_eq!(mapped[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(mapped[1].content.as_deref(), Some(r#"{"utc":"now"}"#));
    }

    #[tokio::test]
    async fn stub_records_requests_and_scripts_tool_calls() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tool","name":"echo","arguments":{"text":"a"}}"#.into(),
            "plain text".into(),
        ]);
        let first = model
            .complete_chat(&[Message::user("x")], &[], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(first.tool_calls[0].name, "echo");
        let second = model
            .complete_chat(&[Message::user("y")], &[], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(second.content.as_deref(), Some("plain text"));
        assert_eq!(model.requests().len(), 2);
        assert!(model
            .complete_chat(&[], &[], &ChatOptions::default())
            .await
            .is_err());
    }
}
