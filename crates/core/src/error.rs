//! Error types for the engine.

use crate::types::{TaskError, TaskErrorKind, TaskName, WorkflowId, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// Graph-shape and input errors, raised at submission before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("cyclic dependency among tasks: {}", join_names(.cycle))]
    CyclicDependency { cycle: Vec<TaskName> },

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskName, dependency: TaskName },

    #[error("invalid workflow: {0}")]
    Validation(String),
}

fn join_names(names: &[TaskName]) -> String {
    names
        .iter()
        .map(TaskName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Kind of a sandbox failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    Timeout,
    MemoryExceeded,
    RuntimeError,
    ValidationError,
    Cancelled,
    /// The enforcement layer failed; fatal for the sandbox instance
    Internal,
}

impl std::fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::RuntimeError => "runtime_error",
            Self::ValidationError => "validation_error",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Failure descriptor of one code execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SandboxError {
    pub kind: SandboxErrorKind,
    pub message: String,
}

impl SandboxError {
    pub fn new(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            SandboxErrorKind::Timeout,
            format!("execution exceeded {} ms", timeout_ms),
        )
    }

    pub fn memory_exceeded(detail: impl std::fmt::Display, limit_mb: u64) -> Self {
        Self::new(
            SandboxErrorKind::MemoryExceeded,
            format!("{} (limit {} MB)", detail, limit_mb),
        )
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorKind::RuntimeError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorKind::ValidationError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(SandboxErrorKind::Cancelled, "execution cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorKind::Internal, message)
    }

    /// True when the enforcement layer itself failed, as opposed to the executed code.
    pub fn is_fatal(&self) -> bool {
        self.kind == SandboxErrorKind::Internal
    }
}

/// Errors returned through the tool boundary
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("task timed out after {0} ms")]
    TimedOut(u64),

    #[error("tool call cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sandbox(e) => matches!(
                e.kind,
                SandboxErrorKind::RuntimeError
                    | SandboxErrorKind::Timeout
                    | SandboxErrorKind::MemoryExceeded
            ),
            Self::TimedOut(_) | Self::Other(_) => true,
            Self::UnknownTool(_) | Self::InvalidArguments { .. } | Self::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Sandbox(e) if e.kind == SandboxErrorKind::Cancelled)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Sandbox(e) if e.is_fatal())
    }
}

impl From<&ToolError> for TaskError {
    fn from(error: &ToolError) -> Self {
        let kind = match error {
            ToolError::UnknownTool(_) => TaskErrorKind::UnknownTool,
            ToolError::InvalidArguments { .. } => TaskErrorKind::ValidationError,
            ToolError::Sandbox(e) => match e.kind {
                SandboxErrorKind::Timeout => TaskErrorKind::Timeout,
                SandboxErrorKind::MemoryExceeded => TaskErrorKind::MemoryExceeded,
                SandboxErrorKind::RuntimeError => TaskErrorKind::RuntimeError,
                SandboxErrorKind::ValidationError => TaskErrorKind::ValidationError,
                SandboxErrorKind::Cancelled => TaskErrorKind::Cancelled,
                SandboxErrorKind::Internal => TaskErrorKind::Internal,
            },
            ToolError::TimedOut(_) => TaskErrorKind::Timeout,
            ToolError::Cancelled => TaskErrorKind::Cancelled,
            ToolError::Other(_) => TaskErrorKind::ToolFailed,
        };
        TaskError::new(kind, error.to_string())
    }
}

/// Errors from the workflow executor's public operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("cannot {operation} workflow {id} while {status}")]
    InvalidState {
        id: WorkflowId,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("workflow {0} coordinator stopped")]
    Closed(WorkflowId),
}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_error_lists_members() {
        let err = GraphError::CyclicDependency {
            cycle: vec![TaskName::new("a"), TaskName::new("b")],
        };
        assert_eq!(err.to_string(), "cyclic dependency among tasks: a -> b");
    }

    #[test]
    fn test_tool_error_classification() {
        let timeout = ToolError::Sandbox(SandboxError::timeout(50));
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());
        assert_eq!(TaskError::from(&timeout).kind, TaskErrorKind::Timeout);

        let crash = ToolError::Sandbox(SandboxError::internal("worker panicked"));
        assert!(crash.is_fatal());
        assert!(!crash.is_retryable());
        assert_eq!(TaskError::from(&crash).kind, TaskErrorKind::Internal);

        let cancelled = ToolError::Sandbox(SandboxError::cancelled());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retryable());

        let invalid = ToolError::invalid_arguments("execute_code", "missing code");
        assert_eq!(TaskError::from(&invalid).kind, TaskErrorKind::ValidationError);
    }
}
