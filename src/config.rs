use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// What happens to the dependents of a task that failed or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Cancel every transitive dependent.
    #[default]
    Cancel,
    /// Leave dependents pending, annotated with the blocking ancestor.
    Block,
}

/// When a workflow with a failed member is reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowFailurePolicy {
    /// As soon as any member fails.
    #[default]
    FailFast,
    /// Once every member is terminal.
    WaitAll,
}

/// Engine configuration, stored as `~/.conductor/conductor.toml`.
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_max_retries: u32,
    pub max_retries_limit: u32,
    pub task_timeout_secs: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub performance_alpha: f64,
    pub initial_performance_score: f64,
    pub cascade_policy: CascadePolicy,
    pub workflow_failure_policy: WorkflowFailurePolicy,
    pub event_buffer: usize,
    /// Agents silent for longer than this are marked offline. Unset disables the check.
    pub heartbeat_timeout_secs: Option<u64>,
    /// Snapshot file written on shutdown and read by `conductor run --resume`.
    pub state_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            max_retries_limit: 10,
            task_timeout_secs: 30 * 60,
            retry_backoff_base_ms: 1000,
            retry_backoff_max_ms: 60_000,
            performance_alpha: 0.2,
            initial_performance_score: 0.5,
            cascade_policy: CascadePolicy::Cancel,
            workflow_failure_policy: WorkflowFailurePolicy::FailFast,
            event_buffer: 1024,
            heartbeat_timeout_secs: None,
            state_path: None,
        }
    }
}

impl EngineConfig {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_retries > self.max_retries_limit {
            return Err(Error::Validation(format!(
                "default_max_retries ({}) exceeds max_retries_limit ({})",
                self.default_max_retries, self.max_retries_limit
            )));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Validation("task_timeout_secs must be positive".into()));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(Error::Validation(
                "retry_backoff_base_ms exceeds retry_backoff_max_ms".into(),
            ));
        }
        if !(self.performance_alpha > 0.0 && self.performance_alpha <= 1.0) {
            return Err(Error::Validation(format!(
                "performance_alpha must be in (0, 1], got {}",
                self.performance_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.initial_performance_score) {
            return Err(Error::Validation(format!(
                "initial_performance_score must be in [0, 1], got {}",
                self.initial_performance_score
            )));
        }
        if self.event_buffer == 0 {
            return Err(Error::Validation("event_buffer must be positive".into()));
        }
        if self.heartbeat_timeout_secs == Some(0) {
            return Err(Error::Validation(
                "heartbeat_timeout_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn state_file(&self) -> Option<PathBuf> {
        self.state_path.as_deref().map(expand_tilde)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
