use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::message::{Message, ToolCall, ToolResult};

#[async_trait]
pub trait AgentHook: Send + Sync {
    async fn before_model(&self, _agent: &str, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    async fn after_model(&self, _agent: &str, _content: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn before_tool_call(&self, _agent: &str, _call: &ToolCall) -> Result<()> {
        Ok(())
    }

    async fn after_tool_result(&self, _agent: &str, _result: &ToolResult) -> Result<()> {
        Ok(())
    }
}

/// Emits the agent loop as `tracing` events.
pub struct TracingHook;

#[async_trait]
impl AgentHook for TracingHook {
    async fn before_model(&self, agent: &str, messages: &[Message]) -> Result<()> {
        tracing::debug!(agent, messages = messages.len(), "calling model");
        Ok(())
    }

    async fn after_model(&self, agent: &str, content: Option<&str>) -> Result<()> {
        tracing::debug!(agent, chars = content.map(str::len).unwrap_or(0), "model replied");
        Ok(())
    }

    async fn before_tool_call(&self, agent: &str, call: &ToolCall) -> Result<()> {
        tracing::info!(agent, tool = %call.name, arguments = %call.arguments, "tool call");
        Ok(())
    }

    async fn after_tool_result(&self, agent: &str, result: &ToolResult) -> Result<()> {
        tracing::debug!(agent, tool = %result.name, "tool returned");
        Ok(())
    }
}

/// Human-approval gate for tool calls.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm_tool_call(&self, agent: &str, call: &ToolCall) -> Result<bool>;
}

/// Always answers the same way.
pub struct StaticApproval(pub bool);

#[async_trait]
impl ConfirmationHandler for StaticApproval {
    async fn confirm_tool_call(&self, _agent: &str, _call: &ToolCall) -> Result<bool> {
        Ok(self.0)
    }
}

/// Lines of one input, read by a single task.
///
/// The chat loop and [`StdinApproval`] pull from the same queue, so an
/// answer typed (or piped) for the approval prompt is never taken as the
/// next chat message.
#[derive(Clone)]
pub struct ConsoleLines {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl ConsoleLines {
    pub fn stdin() -> Self {
        Self::spawn(tokio::io::stdin())
    }

    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "console input closed");
                        break;
                    }
                }
            }
        });
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next line, or `None` once the input is exhausted.
    pub async fn next_line(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// Asks the operator on the terminal. Anything but `y`/`yes` rejects,
/// including end of input.
pub struct StdinApproval {
    input: ConsoleLines,
}

impl StdinApproval {
    pub fn new(input: ConsoleLines) -> Self {
        Self { input }
    }
}

#[async_trait]
impl ConfirmationHandler for StdinApproval {
    async fn confirm_tool_call(&self, agent: &str, call: &ToolCall) -> Result<bool> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(
                format!(
                    "[{agent}] wants to call `{}` with {}. Approve? [y/N] ",
                    call.name, call.arguments
                )
                .as_bytes(),
            )
            .await?;
        stdout.flush().await?;

        let answer = self.input.next_line().await.unwrap_or_default();
        Ok(is_affirmative(&answer))
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "o" | "oui"
    )
}
