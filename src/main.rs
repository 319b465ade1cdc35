//! `agent-labs` binary entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use agent_labs::config::AppConfig;
use agent_labs::hooks::{ConsoleLines, StdinApproval};
use agent_labs::runtime::LabRuntime;
use agent_labs::telemetry::init_tracing;
use agent_labs::tools::classify;
use agent_labs::AgentEvent;

#[derive(Debug, Parser)]
#[command(name = "agent-labs", version, about = "Host configured chat agents")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "labs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the REST, SSE and A2A endpoints
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to one agent in the terminal
    Chat {
        #[arg(short, long)]
        agent: String,
        /// Resume a conversation
        #[arg(long)]
        context: Option<String>,
    },
    /// List the configured agents
    Agents,
    /// Classify a problem description
    Classify { text: String },
    /// Run a configured workflow once
    Workflow { name: String, input: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Command::Classify { text } = &cli.command {
        println!("{}", serde_json::to_string_pretty(&classify(text))?);
        return Ok(());
    }

    let config = AppConfig::from_env_or_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.logging);

    match cli.command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Chat { agent, context } => chat(config, agent, context).await,
        Command::Agents => {
            for agent in &config.agents {
                println!("{:<16} {}", agent.id, agent.description);
                if !agent.tools.is_empty() || !agent.handoffs.is_empty() {
                    println!("{:<16} tools: {:?} handoffs: {:?}", "", agent.tools, agent.handoffs);
                }
            }
            Ok(())
        }
        Command::Workflow { name, input } => {
            let runtime = LabRuntime::from_config(config).await?;
            let outcome = runtime.workflow(&name)?.run(input).await?;
            println!("{}", outcome.output);
            Ok(())
        }
        Command::Classify { .. } => Ok(()),
    }
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let runtime = LabRuntime::from_config(config).await?;
    agent_labs::server::serve(Arc::new(runtime), addr).await?;
    Ok(())
}

async fn chat(config: AppConfig, agent_id: String, context: Option<String>) -> Result<()> {
    let input = ConsoleLines::stdin();
    let runtime = LabRuntime::builder(config)
        .with_confirmation_handler(Arc::new(StdinApproval::new(input.clone())))
        .build()
        .await?;
    let service = runtime.chat();
    let context = service.resolve_context(&agent_id, context.as_deref())?;
    println!("context: {}  (empty line or /quit to leave)", context.token);

    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = input.next_line().await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line == "/quit" {
            break;
        }

        let (tx, mut rx) = mpsc::channel(64);
        let turn = async {
            let tx = tx;
            service.chat_streaming(&context, line, &tx).await
        };
        let print = async {
            let mut out = tokio::io::stdout();
            while let Some(event) = rx.recv().await {
                let rendered = match event {
                    AgentEvent::Delta { content } => content,
                    AgentEvent::ToolCall { name, arguments } => format!("\n[{name}] {arguments}\n"),
                    AgentEvent::ToolResult { name, .. } => format!("[{name}] done\n"),
                    AgentEvent::ApprovalRejected { name } => format!("[{name}] rejected\n"),
                };
                let _ = out.write_all(rendered.as_bytes()).await;
                let _ = out.flush().await;
            }
        };
        let (result, ()) = tokio::join!(turn, print);
        match result {
            Ok(_) => println!(),
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(())
}
