use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LabError, Result};

/// Sections that must be present in every configuration file.
const REQUIRED_SECTIONS: &[&str] = &["model", "agents"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Azure,
    OpenAi,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: ModelProvider,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub deployment: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub embedding_deployment: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ModelConfig {
    pub fn new(provider: ModelProvider, deployment: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: None,
            deployment: deployment.into(),
            api_key: None,
            api_version: default_api_version(),
            embedding_deployment: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_version() -> String {
    "2024-10-21".into()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            database_url: None,
        }
    }
}

fn default_storage_path() -> String {
    "threads".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SecurityConfig {
    /// Secret used to sign context ids. A random one is generated when absent.
    #[serde(default)]
    pub context_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub sections_path: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            sections_path: None,
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

/// Declarative description of one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub instructions: String,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub handoffs: Vec<String>,
    #[serde(default)]
    pub requires_approval: Vec<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub history_window: Option<usize>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            instructions: instructions.into(),
            deployment: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            response_schema: None,
            tools: Vec::new(),
            handoffs: Vec::new(),
            requires_approval: Vec::new(),
            max_steps: default_max_steps(),
            history_window: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_max_steps() -> usize {
    8
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    pub name: String,
    pub mode: WorkflowMode,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

impl AppConfig {
    /// Parse and validate a TOML document. Missing required sections fail
    /// before any other field is looked at.
    pub fn parse(raw: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(raw)
            .map_err(|err| LabError::Config(format!("failed to parse configuration: {err}")))?;
        for section in REQUIRED_SECTIONS {
            if !table.contains_key(*section) {
                return Err(LabError::MissingSection((*section).to_string()));
            }
        }
        let cfg: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|err| LabError::Config(format!("invalid configuration: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply `LABS_*` overrides. A value that does not parse is an error
    /// naming the variable, never a silent fallback.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("LABS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("LABS_PORT") {
            self.server.port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid_env("LABS_PORT", &port))?;
        }
        if let Some(endpoint) = lookup("LABS_MODEL_ENDPOINT") {
            self.model.endpoint = Some(endpoint);
        }
        if let Some(deployment) = lookup("LABS_MODEL_DEPLOYMENT") {
            self.model.deployment = deployment;
        }
        if let Some(key) = lookup("LABS_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(backend) = lookup("LABS_STORAGE_BACKEND") {
            self.storage.backend = match backend.trim().to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "file" => StorageBackend::File,
                "sqlite" => StorageBackend::Sqlite,
                _ => return Err(invalid_env("LABS_STORAGE_BACKEND", &backend)),
            };
        }
        if let Some(url) = lookup("LABS_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        if let Some(secret) = lookup("LABS_CONTEXT_SECRET") {
            self.security.context_secret = Some(secret);
        }
        if let Some(json) = lookup("LABS_LOG_JSON") {
            self.logging.json = json
                .trim()
                .to_ascii_lowercase()
                .parse::<bool>()
                .map_err(|_| invalid_env("LABS_LOG_JSON", &json))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(LabError::MissingSection("agents".into()));
        }
        if self.model.deployment.trim().is_empty() {
            return Err(LabError::Config("model.deployment must not be empty".into()));
        }

        let mut ids = HashSet::new();
        for agent in &self.agents {
            if !ids.insert(agent.id.as_str()) {
                return Err(LabError::Config(format!("duplicate agent id `{}`", agent.id)));
            }
        }
        for agent in &self.agents {
            for target in &agent.handoffs {
                if !ids.contains(target.as_str()) {
                    return Err(LabError::Config(format!(
                        "agent `{}` hands off to unknown agent `{target}`",
                        agent.id
                    )));
                }
            }
        }
        for flow in &self.workflows {
            if flow.agents.is_empty() {
                return Err(LabError::Config(format!(
                    "workflow `{}` has no agents",
                    flow.name
                )));
            }
            for member in &flow.agents {
                if !ids.contains(member.as_str()) {
                    return Err(LabError::Config(format!(
                        "workflow `{}` references unknown agent `{member}`",
                        flow.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|agent| agent.id == id)
    }
}

impl FromStr for AppConfig {
    type Err = LabError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

fn invalid_env(var: &str, value: &str) -> LabError {
    LabError::Config(format!("invalid value `{value}` for {var}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[model]
provider = "azure"
endpoint = "https://example.openai.azure.com"
deployment = "gpt-4o-mini"

[[agents]]
id = "support"
instructions = "Tu es un agent de support."
tools = ["classify_problem"]
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = AppConfig::parse(MINIMAL).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.model.api_version, "2024-10-21");
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.agents[0].max_steps, 8);
        assert_eq!(cfg.agents[0].display_name(), "support");
        assert_eq!(cfg.knowledge.top_k, 3);
    }

    #[test]
    fn missing_model_section_is_reported_by_name() {
        let err = AppConfig::parse("[[agents]]\nid='a'\ninstructions='x'").unwrap_err();
        assert!(matches!(err, LabError::MissingSection(ref s) if s == "model"));
        assert_eq!(err.to_string(), "configuration section `model` missing");
    }

    #[test]
    fn missing_agents_section_is_reported() {
        let err = AppConfig::parse("[model]\ndeployment='gpt-4o'").unwrap_err();
        assert!(matches!(err, LabError::MissingSection(ref s) if s == "agents"));
    }

    #[test]
    fn rejects_unknown_workflow_member() {
        let raw = format!(
            "{MINIMAL}\n[[workflows]]\nname='review'\nmode='sequential'\nagents=['support','ghost']\n"
        );
        let err = AppConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_duplicate_agent_ids() {
        let raw = format!("{MINIMAL}\n[[agents]]\nid='support'\ninstructions='again'\n");
        let err = AppConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{MINIMAL}").unwrap();

        env::set_var("LABS_PORT", "9100");
        env::set_var("LABS_CONTEXT_SECRET", "s3cret");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("LABS_PORT");
        env::remove_var("LABS_CONTEXT_SECRET");

        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.security.context_secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.model.provider, ModelProvider::Azure);
    }

    #[test]
    fn invalid_overrides_fail_with_the_variable_name() {
        let mut cfg: AppConfig = MINIMAL.parse().unwrap();
        cfg.storage.backend = StorageBackend::Sqlite;

        let err = cfg
            .apply_overrides(|key| (key == "LABS_STORAGE_BACKEND").then(|| "sqlit".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LABS_STORAGE_BACKEND"), "{err}");
        assert!(err.to_string().contains("sqlit"));
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);

        let err = cfg
            .apply_overrides(|key| (key == "LABS_PORT").then(|| "80800".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LABS_PORT"));
        assert_eq!(cfg.server.port, 8080);

        let err = cfg
            .apply_overrides(|key| (key == "LABS_LOG_JSON").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LABS_LOG_JSON"));
    }

    #[test]
    fn valid_overrides_are_applied() {
        let mut cfg: AppConfig = MINIMAL.parse().unwrap();
        cfg.apply_overrides(|key| match key {
            "LABS_STORAGE_BACKEND" => Some("File".to_string()),
            "LABS_LOG_JSON" => Some("TRUE".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::File);
        assert!(cfg.logging.json);
    }
}
