//! Agent backends: how a participant turns a prompt into raw text.
//!
//! The runtime only sees the `AgentBackend` trait; the concrete backends
//! bind an external CLI through the invoker with a scrubbed environment.

mod prompt;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AgentsConfig, InvokerConfig};
use crate::error::{ParleyError, Result};
use crate::invoker::{CliInvoker, InvokeError, InvokeRequest};

pub use prompt::{PromptContext, build_prompt};

/// Environment overrides for the bundled profiles.
pub const CLAUDE_BIN_ENV: &str = "CLAUDE_BIN";
pub const CODEX_BIN_ENV: &str = "CODEX_BIN";

/// A participant's way of producing a reply to a prompt.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
    ) -> std::result::Result<String, InvokeError>;
}

/// Binary binding for one external CLI assistant.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args,
            env: HashMap::new(),
        }
    }

    /// The Claude Code CLI in non-interactive print mode.
    pub fn claude(config: &AgentsConfig) -> Self {
        let binary = std::env::var(CLAUDE_BIN_ENV)
            .ok()
            .or_else(|| config.claude_bin.clone())
            .unwrap_or_else(|| "claude".to_string());
        Self::new("claude", binary, vec!["-p".to_string()])
    }

    /// The Codex CLI in exec mode.
    pub fn codex(config: &AgentsConfig) -> Self {
        let binary = std::env::var(CODEX_BIN_ENV)
            .ok()
            .or_else(|| config.codex_bin.clone())
            .unwrap_or_else(|| "codex".to_string());
        Self::new("codex", binary, vec!["exec".to_string()])
    }

    pub fn by_name(name: &str, config: &AgentsConfig) -> Result<Self> {
        match name {
            "claude" => Ok(Self::claude(config)),
            "codex" => Ok(Self::codex(config)),
            other => Err(ParleyError::UnknownAgent(other.to_string())),
        }
    }

    /// Resolve the binary to an existing path, searching `PATH` for bare
    /// names. Used as a startup preflight; failure is fatal.
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        let missing = || ParleyError::BinaryNotFound(self.binary.display().to_string());

        if self.binary.components().count() > 1 {
            return if self.binary.is_file() {
                Ok(self.binary.clone())
            } else {
                Err(missing())
            };
        }

        let path_var = std::env::var_os("PATH").ok_or_else(missing)?;
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&self.binary);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(missing())
    }
}

/// `AgentBackend` over a child-process CLI.
pub struct CliBackend {
    profile: AgentProfile,
    invoker: CliInvoker,
    timeout: Duration,
    default_working_dir: Option<PathBuf>,
}

impl CliBackend {
    pub fn new(profile: AgentProfile, config: &InvokerConfig) -> Self {
        Self {
            profile,
            invoker: CliInvoker::from_config(config),
            timeout: Duration::from_millis(config.timeout_ms),
            default_working_dir: None,
        }
    }

    pub fn with_default_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_working_dir = Some(dir.into());
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn name(&self) -> &str {
        &self.profile.name
    }

    async fn respond(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
    ) -> std::result::Result<String, InvokeError> {
        let mut request = InvokeRequest::new(&self.profile.binary, prompt)
            .with_args(self.profile.args.clone())
            .with_timeout(self.timeout)
            .with_env(self.profile.env.clone());

        if let Some(dir) = working_dir.or(self.default_working_dir.as_deref()) {
            request = request.with_working_dir(dir);
        }

        self.invoker.invoke(&request).await
    }
}
