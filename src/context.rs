//! Signed conversation identifiers.
//!
//! A token is `{uuid}.{mac}` where `mac` is the URL-safe base64 HMAC-SHA256
//! of `"{agent_id}:{uuid}"`, so a token issued for one agent is rejected by
//! every other agent.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::error::{LabError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextId {
    pub agent_id: String,
    pub thread: Uuid,
    pub token: String,
}

impl ContextId {
    /// Key under which the conversation is stored.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.thread)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

#[derive(Clone)]
pub struct ContextSigner {
    mac: HmacSha256,
}

impl ContextSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|err| LabError::Config(format!("invalid context secret: {err}")))?;
        Ok(Self { mac })
    }

    /// A signer with a process-local secret.
    pub fn random() -> Result<Self> {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        Self::new(secret)
    }

    pub fn from_config(cfg: &SecurityConfig) -> Result<Self> {
        match cfg.context_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => Self::new(secret),
            None => {
                tracing::warn!(
                    "no context secret configured; context ids will not survive a restart"
                );
                Self::random()
            }
        }
    }

    fn signer_for(&self, agent_id: &str, thread: &Uuid) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(agent_id.as_bytes());
        mac.update(b":");
        mac.update(thread.to_string().as_bytes());
        mac
    }

    pub fn issue(&self, agent_id: &str) -> ContextId {
        let thread = Uuid::new_v4();
        let tag = self.signer_for(agent_id, &thread).finalize().into_bytes();
        ContextId {
            agent_id: agent_id.to_string(),
            thread,
            token: format!("{thread}.{}", URL_SAFE_NO_PAD.encode(tag)),
        }
    }

    pub fn validate(&self, agent_id: &str, token: &str) -> Result<ContextId> {
        let invalid = |reason: &str| LabError::InvalidContext(reason.to_string());
        let (raw_thread, raw_tag) = token
            .split_once('.')
            .ok_or_else(|| invalid("malformed context id"))?;
        let thread = Uuid::parse_str(raw_thread).map_err(|_| invalid("malformed context id"))?;
        // Only the form `issue` produces; parse_str also takes simple, braced and urn forms.
        if raw_thread != thread.hyphenated().to_string() {
            return Err(invalid("malformed context id"));
        }
        let tag = URL_SAFE_NO_PAD
            .decode(raw_tag)
            .map_err(|_| invalid("malformed context id"))?;
        self.signer_for(agent_id, &thread)
            .verify_slice(&tag)
            .map_err(|_| invalid("context id was not issued for this agent"))?;
        Ok(ContextId {
            agent_id: agent_id.to_string(),
            thread,
            token: token.to_string(),
        })
    }

    /// Validate `token` when present, otherwise start a new conversation.
    pub fn resolve(&self, agent_id: &str, token: Option<&str>) -> Result<ContextId> {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => self.validate(agent_id, token),
            None => Ok(self.issue(agent_id)),
        }
    }
}
