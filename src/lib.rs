//! Building blocks for hosting chat-completion agents as an application.
//!
//! The crate provides:
//! - A chat-client abstraction (`LanguageModel`) with an Azure OpenAI / OpenAI client.
//! - Tools (`Tool`, `ToolRegistry`) and the built-in support tools.
//! - An `Agent` that loops between the model and its tools, with approval gates.
//! - Routing, sequential and concurrent workflows over configured agents.
//! - Signed conversation ids, thread storage, and the REST/SSE and A2A surfaces.

#[cfg(feature = "server")]
pub mod a2a;
pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod hooks;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod message;
pub mod routing;
pub mod runtime;
#[cfg(feature = "server")]
pub mod server;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod tool;
pub mod toolkit;
pub mod tools;
pub mod workflow;

pub use agent::{Agent, AgentEvent};
pub use config::{AgentConfig, AppConfig, ModelConfig, ModelProvider, WorkflowConfig, WorkflowMode};
pub use context::{ContextId, ContextSigner};
pub use error::{LabError, Result};
pub use factory::{AgentDirectory, AgentFactory};
pub use hooks::{
    AgentHook, ConfirmationHandler, ConsoleLines, StaticApproval, StdinApproval, TracingHook,
};
pub use knowledge::{
    Document, Embedder, HashingEmbedder, InMemoryVectorStore, KnowledgeBase, OpenAIEmbedder,
    PolicySection, Retriever, ScoredDocument, VectorStore,
};
pub use llm::{ChatOptions, LanguageModel, ModelCompletion, OpenAIClient, StubModel};
pub use memory::{ConversationMemory, MemoryStrategy, WindowedMemoryStrategy};
pub use message::{Message, Role, ToolCall, ToolResult};
pub use routing::{coordinator, AgentTool};
pub use runtime::{LabRuntime, RuntimeBuilder};
pub use service::{ChatService, ChatTurn};
#[cfg(feature = "persistence")]
pub use storage::SqlConversationStore;
pub use storage::{
    open_store, ConversationStore, FileConversationStore, InMemoryConversationStore,
};
pub use tool::{FunctionTool, Tool, ToolDescription, ToolRegistry};
pub use toolkit::{default_catalog, ToolCatalog};
pub use workflow::{Workflow, WorkflowEvent, WorkflowOutcome};
