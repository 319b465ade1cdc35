//! Agent-to-agent JSON-RPC surface: one endpoint and one agent card per agent.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agent::{Agent, AgentEvent};
use crate::context::ContextId;
use crate::error::LabError;
use crate::server::SharedRuntime;

pub const PROTOCOL_VERSION: &str = "0.2.5";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const AGENT_NOT_FOUND: i32 = -32001;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<LabError> for RpcError {
    fn from(err: LabError) -> Self {
        let code = match &err {
            LabError::AgentNotFound(_) => AGENT_NOT_FOUND,
            LabError::InvalidContext(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

pub fn routes() -> Router<SharedRuntime> {
    Router::new()
        .route("/a2a/:agent/.well-known/agent.json", get(agent_card))
        .route("/a2a/:agent", post(handle_rpc))
}

/// The card advertises one skill per tool, or the agent itself when it has none.
pub fn card_for(agent: &Agent, url: &str) -> Value {
    let mut skills: Vec<Value> = agent
        .tool_descriptions()
        .into_iter()
        .map(|tool| {
            json!({
                "id": tool.name,
                "name": tool.name,
                "description": tool.description,
                "tags": [],
            })
        })
        .collect();
    if skills.is_empty() {
        skills.push(json!({
            "id": agent.id(),
            "name": agent.name(),
            "description": agent.description(),
            "tags": [],
        }));
    }
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "name": agent.name(),
        "description": agent.description(),
        "url": url,
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": { "streaming": true },
        "defaultInputModes": ["text/plain"],
        "defaultOutputModes": ["text/plain"],
        "skills": skills,
    })
}

async fn agent_card(
    State(runtime): State<SharedRuntime>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let agent = match runtime.chat().agent(&agent_id) {
        Ok(agent) => agent,
        Err(err) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() })))
                .into_response()
        }
    };
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let url = format!("http://{host}/a2a/{agent_id}");
    Json(card_for(&agent, &url)).into_response()
}

struct Inbound {
    text: String,
    context_id: Option<String>,
}

/// Text parts of `params.message`, joined by newlines.
fn inbound_message(params: &Value) -> Result<Inbound, RpcError> {
    let message = params
        .get("message")
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "params.message is required"))?;
    let parts = message
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "message.parts must be an array"))?;
    let text = parts
        .iter()
        .filter(|part| {
            part.get("kind").or_else(|| part.get("type")).and_then(Value::as_str) == Some("text")
        })
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(RpcError::new(INVALID_PARAMS, "message has no text part"));
    }
    let context_id = message
        .get("contextId")
        .or_else(|| params.get("contextId"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Inbound { text, context_id })
}

fn parse_request(body: &[u8]) -> Result<RpcRequest, RpcResponse> {
    let raw: Value = serde_json::from_slice(body).map_err(|err| {
        RpcResponse::failure(Value::Null, RpcError::new(PARSE_ERROR, format!("parse error: {err}")))
    })?;
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let invalid = |message: &str| {
        RpcResponse::failure(id.clone(), RpcError::new(INVALID_REQUEST, message))
    };
    if !raw.is_object() {
        return Err(invalid("request must be a JSON object"));
    }
    let request: RpcRequest =
        serde_json::from_value(raw).map_err(|_| invalid("invalid request object"))?;
    if request.jsonrpc.as_deref() != Some("2.0") {
        return Err(invalid("jsonrpc must be \"2.0\""));
    }
    if request.method.is_none() {
        return Err(invalid("method is required"));
    }
    Ok(request)
}

async fn handle_rpc(
    State(runtime): State<SharedRuntime>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return Json(response).into_response(),
    };
    let id = request.id.clone();
    let fail = |error: RpcError| Json(RpcResponse::failure(id.clone(), error)).into_response();

    let method = request.method.as_deref().unwrap_or_default();
    if !matches!(method, "message/send" | "message/stream") {
        return fail(RpcError::new(
            METHOD_NOT_FOUND,
            format!("method `{method}` not found"),
        ));
    }
    let inbound = match inbound_message(&request.params) {
        Ok(inbound) => inbound,
        Err(error) => return fail(error),
    };
    let context = match runtime
        .chat()
        .resolve_context(&agent_id, inbound.context_id.as_deref())
    {
        Ok(context) => context,
        Err(err) => return fail(err.into()),
    };
    tracing::debug!(agent = %agent_id, method, "a2a request");

    if method == "message/send" {
        match runtime.chat().chat(&agent_id, &inbound.text, Some(&context.token)).await {
            Ok(turn) => Json(RpcResponse::success(
                id,
                agent_message(&turn.context_id, &turn.reply),
            ))
            .into_response(),
            Err(err) => fail(err.into()),
        }
    } else {
        stream_message(runtime, context, inbound.text, id).into_response()
    }
}

fn agent_message(context_id: &str, text: &str) -> Value {
    json!({
        "kind": "message",
        "role": "agent",
        "messageId": Uuid::new_v4().to_string(),
        "contextId": context_id,
        "parts": [{ "kind": "text", "text": text }],
    })
}

fn rpc_event(response: &RpcResponse) -> Event {
    Event::default().data(json!(response).to_string())
}

/// Each delta becomes an `artifact-update`; the stream ends with a final
/// `status-update` (or a JSON-RPC error when the turn fails).
fn stream_message(
    runtime: SharedRuntime,
    context: ContextId,
    text: String,
    id: Value,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let task_id = Uuid::new_v4().to_string();
    let artifact_id = Uuid::new_v4().to_string();

    tokio::spawn(async move {
        let (agent_tx, mut agent_rx) = mpsc::channel::<AgentEvent>(64);
        let token = context.token.clone();
        let turn = async {
            let agent_tx = agent_tx;
            runtime.chat().chat_streaming(&context, &text, &agent_tx).await
        };
        let forward = async {
            let mut first = true;
            while let Some(event) = agent_rx.recv().await {
                let AgentEvent::Delta { content } = event else {
                    continue;
                };
                let update = json!({
                    "kind": "artifact-update",
                    "taskId": task_id,
                    "contextId": token,
                    "artifact": {
                        "artifactId": artifact_id,
                        "parts": [{ "kind": "text", "text": content }],
                    },
                    "append": !first,
                    "lastChunk": false,
                });
                first = false;
                let _ = tx
                    .send(rpc_event(&RpcResponse::success(id.clone(), update)))
                    .await;
            }
        };
        let (result, ()) = tokio::join!(turn, forward);

        let closing = match result {
            Ok(_) => RpcResponse::success(
                id.clone(),
                json!({
                    "kind": "status-update",
                    "taskId": task_id,
                    "contextId": token,
                    "status": { "state": "completed", "timestamp": Utc::now().to_rfc3339() },
                    "final": true,
                }),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "a2a stream failed");
                RpcResponse::failure(id.clone(), err.into())
            }
        };
        let _ = tx.send(rpc_event(&closing)).await;
    });

    Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}
