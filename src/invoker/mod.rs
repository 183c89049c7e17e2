//! Child-process invocation of external CLI assistants.
//!
//! Spawns the binary with stdin closed and both output streams captured,
//! bounded by a timeout. A child that outlives its timeout gets SIGTERM,
//! a grace period, then SIGKILL, so a wedged CLI can never accumulate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::InvokerConfig;

/// Environment variables preserved when scrubbing for a nested CLI call.
const PRESERVED_ENV: [&str; 4] = ["HOME", "PATH", "USER", "TERM"];

#[derive(Error, Debug)]
pub enum InvokeError {
    /// The child exceeded its deadline and was terminated. Routes to
    /// retry-with-backoff upstream.
    #[error("Timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Nonzero exit; carries stderr or an exit-code message.
    #[error("{0}")]
    Failed(String),

    /// Exit 0 but nothing on stdout.
    #[error("empty output")]
    EmptyOutput,

    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),
}

impl InvokeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// One invocation: binary, fixed argument vector, the prompt as the final
/// argument, and an explicit environment.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(binary: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            prompt: prompt.into(),
            working_dir: None,
            env: HashMap::new(),
            timeout: Duration::from_millis(InvokerConfig::default().timeout_ms),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

pub struct CliInvoker {
    grace: Duration,
}

impl Default for CliInvoker {
    fn default() -> Self {
        Self::new(Duration::from_millis(InvokerConfig::default().grace_ms))
    }
}

impl CliInvoker {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn from_config(config: &InvokerConfig) -> Self {
        Self::new(Duration::from_millis(config.grace_ms))
    }

    /// Run the request to completion. Success is exit 0 with non-empty
    /// stdout; anything else is an error, with timeouts reported as
    /// `InvokeError::Timeout` no matter how the child finally died.
    pub async fn invoke(&self, request: &InvokeRequest) -> Result<String, InvokeError> {
        let mut command = Command::new(&request.binary);
        command
            .args(&request.args)
            .arg(&request.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        for key in PRESERVED_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command.envs(&request.env);

        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        debug!(
            binary = %request.binary.display(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Spawning child"
        );

        let mut child = command.spawn().map_err(InvokeError::Spawn)?;
        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(InvokeError::Spawn)?,
            _ = tokio::time::sleep(request.timeout) => {
                warn!(binary = %request.binary.display(), "Child timed out, terminating");
                self.terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(InvokeError::Timeout(request.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if status.success() {
            if stdout.trim().is_empty() {
                return Err(InvokeError::EmptyOutput);
            }
            return Ok(stdout);
        }

        let message = if stderr.trim().is_empty() {
            match status.code() {
                Some(code) => format!("exit {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr.trim().to_string()
        };
        Err(InvokeError::Failed(message))
    }

    /// SIGTERM, wait out the grace period, then SIGKILL. The child is
    /// reaped before returning.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                    return;
                }
                warn!(pid, "Child ignored SIGTERM, sending SIGKILL");
            }
        }

        if let Err(e) = child.kill().await {
            debug!(error = %e, "Kill failed (child already gone)");
        }
    }
}

fn drain(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}
