use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration, usually loaded from `dagbox.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Resource bounds applied to every execution of one sandbox instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
}

/// Which completed results survive a replan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanPolicy {
    /// Keep a result when tool, params and dependencies are unchanged
    #[default]
    Structural,
    /// Structural, and also drop results downstream of any changed task
    Strict,
    /// Keep a result whenever the task name still exists
    NameOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_timeout_ms")]
    pub task_timeout_ms: u64,

    /// How long a cancelled tool call may take to acknowledge
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default)]
    pub replan_policy: ReplanPolicy,

    /// Keep new workflows in `Pending` until `continue_run`
    #[serde(default)]
    pub hold_on_submit: bool,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_code_bytes() -> usize {
    1024 * 1024
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_cancel_grace_ms() -> u64 {
    1_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            max_call_depth: default_max_call_depth(),
            max_code_bytes: default_max_code_bytes(),
        }
    }
}

impl SandboxConfig {
    pub fn new(timeout_ms: u64, memory_limit_mb: u64) -> Self {
        Self {
            timeout_ms,
            memory_limit_mb,
            ..Default::default()
        }
    }

    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_ms must be positive".into()));
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_mb must be positive".into(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_call_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            replan_policy: ReplanPolicy::default(),
            hold_on_submit: false,
            event_buffer: default_event_buffer(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrent_tasks must be positive".into(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.task_timeout_ms must be positive".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "executor.event_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml(&content)?
        } else {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sandbox.validate()?;
        self.executor.validate()
    }
}
