//! REST and SSE surface over a [`LabRuntime`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::agent::AgentEvent;
use crate::error::{LabError, Result};
use crate::runtime::LabRuntime;
use crate::service::ChatTurn;
use crate::telemetry::log_requests;
use crate::workflow::WorkflowEvent;

pub type SharedRuntime = Arc<LabRuntime>;

/// JSON `{"error": ...}` with a status derived from the failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        let status = match &err {
            LabError::AgentNotFound(_) | LabError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            LabError::InvalidContext(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunWorkflowRequest {
    pub input: String,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id/chat", post(chat))
        .route("/api/agents/:id/stream", post(stream_chat))
        .route(
            "/api/agents/:id/threads/:context_id",
            get(thread_history).delete(clear_thread),
        )
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/:name/run", post(run_workflow))
        .route("/events", get(workflow_events))
        .merge(crate::a2a::routes())
        .layer(middleware::from_fn(log_requests))
        .with_state(runtime)
}

pub async fn serve(runtime: SharedRuntime, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(runtime).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(|err| LabError::Protocol(format!("server error: {err}")))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_agents(State(runtime): State<SharedRuntime>) -> impl IntoResponse {
    Json(runtime.chat().agents())
}

fn require_message(message: &str) -> ApiResult<()> {
    if message.trim().is_empty() {
        return Err(ApiError::bad_request("`message` must not be empty"));
    }
    Ok(())
}

async fn chat(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatTurn>> {
    require_message(&request.message)?;
    let turn = runtime
        .chat()
        .chat(&id, &request.message, request.context_id.as_deref())
        .await?;
    Ok(Json(turn))
}

fn sse_event(name: &str, data: Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

fn agent_event(event: AgentEvent) -> Event {
    let mut payload = serde_json::to_value(&event).unwrap_or(Value::Null);
    let name = payload
        .as_object_mut()
        .and_then(|fields| fields.remove("type"))
        .and_then(|kind| kind.as_str().map(str::to_string))
        .unwrap_or_else(|| "message".to_string());
    sse_event(&name, payload)
}

/// Events: `context`, then `delta` / `tool_call` / `tool_result` /
/// `approval_rejected` while the agent works, then `done` or `error`.
async fn stream_chat(
    State(runtime): State<SharedRuntime>,
    Path(id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    require_message(&request.message)?;
    let context = runtime
        .chat()
        .resolve_context(&id, request.context_id.as_deref())?;
    let (tx, rx) = mpsc::channel::<Event>(64);

    tokio::spawn(async move {
        let _ = tx
            .send(sse_event(
                "context",
                json!({ "agentId": context.agent_id, "contextId": context.token }),
            ))
            .await;

        let (agent_tx, mut agent_rx) = mpsc::channel::<AgentEvent>(64);
        let turn = async move {
            // Dropping the sender when the turn ends closes the forwarder.
            let agent_tx = agent_tx;
            runtime
                .chat()
                .chat_streaming(&context, &request.message, &agent_tx)
                .await
        };
        let forward = async {
            while let Some(event) = agent_rx.recv().await {
                let _ = tx.send(agent_event(event)).await;
            }
        };
        let (result, ()) = tokio::join!(turn, forward);

        let closing = match result {
            Ok(turn) => sse_event("done", json!(turn)),
            Err(err) => {
                tracing::warn!(error = %err, "streamed turn failed");
                sse_event("error", json!({ "error": err.to_string() }))
            }
        };
        let _ = tx.send(closing).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default()))
}

async fn thread_history(
    State(runtime): State<SharedRuntime>,
    Path((id, context_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let messages = runtime.chat().history(&id, &context_id).await?;
    Ok(Json(json!({
        "agentId": id,
        "contextId": context_id,
        "messages": messages,
    })))
}

async fn clear_thread(
    State(runtime): State<SharedRuntime>,
    Path((id, context_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    runtime.chat().clear(&id, &context_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workflows(State(runtime): State<SharedRuntime>) -> impl IntoResponse {
    Json(runtime.workflows())
}

async fn run_workflow(
    State(runtime): State<SharedRuntime>,
    Path(name): Path<String>,
    Json(request): Json<RunWorkflowRequest>,
) -> ApiResult<Json<Value>> {
    let workflow = runtime.workflow(&name)?;
    let outcome = workflow.run(request.input).await?;
    Ok(Json(json!(outcome)))
}

async fn workflow_events(
    State(runtime): State<SharedRuntime>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(workflow_event_stream(runtime.subscribe())).keep_alive(KeepAlive::default())
}

/// A subscriber that falls behind skips the missed events and stays connected.
fn workflow_event_stream(
    events: broadcast::Receiver<WorkflowEvent>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    BroadcastStream::new(events).filter_map(|received| {
        future::ready(match received {
            Ok(event) => Some(Ok(Event::default().data(json!(event).to_string()))),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "workflow event subscriber lagged");
                None
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let status = |err: LabError| ApiError::from(err).status;
        assert_eq!(status(LabError::AgentNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(LabError::WorkflowNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(LabError::InvalidContext("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(LabError::LanguageModel("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn lagging_event_subscribers_stay_connected() {
        let (tx, rx) = broadcast::channel(1);
        for workflow in ["a", "b", "c"] {
            tx.send(WorkflowEvent::Started {
                workflow: workflow.into(),
            })
            .unwrap();
        }
        drop(tx);

        let events: Vec<_> = workflow_event_stream(rx).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }
}
