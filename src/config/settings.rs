use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ParleyError, Result};

/// Environment override for the discussion log directory.
pub const BASE_DIR_ENV: &str = "MULTI_AGENT_BASE_DIR";

const CONFIG_FILE: &str = "parley.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub log: LogConfig,
    pub invoker: InvokerConfig,
    pub runtime: RuntimeConfig,
    pub agents: AgentsConfig,
}

impl ParleyConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join(CONFIG_FILE);
        let content =
            toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_concurrent == 0 {
            return Err(ParleyError::Config(
                "runtime.max_concurrent must be at least 1".into(),
            ));
        }
        if self.runtime.max_rounds == 0 {
            return Err(ParleyError::Config(
                "runtime.max_rounds must be at least 1".into(),
            ));
        }
        if self.runtime.poll_interval_ms < 100 {
            return Err(ParleyError::Config(
                "runtime.poll_interval_ms must be at least 100".into(),
            ));
        }
        if self.log.lock.poll_ms == 0 {
            return Err(ParleyError::Config("log.lock.poll_ms must be nonzero".into()));
        }
        if self.log.lock.deadline_ms < self.log.lock.poll_ms {
            return Err(ParleyError::Config(
                "log.lock.deadline_ms must not be below log.lock.poll_ms".into(),
            ));
        }
        if self.invoker.grace_ms == 0 {
            return Err(ParleyError::Config("invoker.grace_ms must be nonzero".into()));
        }
        Ok(())
    }

    /// Log directory after applying the environment override.
    pub fn resolved_base_dir(&self) -> PathBuf {
        std::env::var_os(BASE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.log.base_dir.clone())
    }
}

/// Discussion log storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding `<id>.jsonl` files. Relative paths resolve
    /// against the process working directory.
    pub base_dir: PathBuf,
    pub lock: LockConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("discussions"),
            lock: LockConfig::default(),
        }
    }
}

/// Cross-process lock file behavior for log appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Retry cadence while another writer holds the lock.
    pub poll_ms: u64,
    /// A lock whose mtime is older than this is reclaimed.
    pub stale_ms: u64,
    /// Give up and surface a retryable error after this long.
    pub deadline_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_ms: 20,
            stale_ms: 30_000,
            deadline_ms: 10_000,
        }
    }
}

/// Child-process invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub timeout_ms: u64,
    /// SIGTERM-to-SIGKILL grace period.
    pub grace_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 180_000,
            grace_ms: 3_000,
        }
    }
}

/// Turn scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub poll_interval_ms: u64,
    pub max_watched_discussions: usize,
    pub cleanup_interval_ms: u64,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_rounds: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub circuit_threshold: u32,
    pub circuit_cooldown_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_watched_discussions: 50,
            cleanup_interval_ms: 60_000,
            max_concurrent: 5,
            max_queue_size: 20,
            max_rounds: 5,
            max_retries: 3,
            retry_base_delay_ms: 30_000,
            retry_max_delay_ms: 120_000,
            circuit_threshold: 5,
            circuit_cooldown_ms: 60_000,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The scan timer re-runs prioritization at twice the poll interval.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms * 2)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    /// Backoff before retry attempt `k` (1-indexed): base doubling per
    /// attempt, capped at the configured maximum.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Agent binary bindings. Environment variables take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub claude_bin: Option<String>,
    pub codex_bin: Option<String>,
    /// Default working directory for invocations when the discussion
    /// context does not carry one.
    pub working_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ParleyConfig::default();
        assert_eq!(config.runtime.max_concurrent, 5);
        assert_eq!(config.runtime.max_queue_size, 20);
        assert_eq!(config.runtime.max_rounds, 5);
        assert_eq!(config.log.lock.stale_ms, 30_000);
        assert_eq!(config.invoker.timeout_ms, 180_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.retry_delay(1), Duration::from_secs(30));
        assert_eq!(runtime.retry_delay(2), Duration::from_secs(60));
        assert_eq!(runtime.retry_delay(3), Duration::from_secs(120));
        assert_eq!(runtime.retry_delay(4), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = ParleyConfig::default();
        config.runtime.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ParleyConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.runtime.max_rounds, 5);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = ParleyConfig::default();
        config.runtime.max_rounds = 7;
        config.agents.claude_bin = Some("/opt/bin/claude".into());
        config.save(dir.path()).await.unwrap();

        let loaded = ParleyConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.runtime.max_rounds, 7);
        assert_eq!(loaded.agents.claude_bin.as_deref(), Some("/opt/bin/claude"));
    }
}
