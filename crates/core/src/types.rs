use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a submitted workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a task, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(pub String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Retry configuration for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    100
}

/// A node in a workflow: one invocation of a named tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<TaskName>,
    #[serde(default)]
    pub requires_approval: bool,
    /// A denied optional task is skipped without failing the workflow
    #[serde(default)]
    pub optional: bool,
    /// Overrides the executor-wide task timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            params: Map::new(),
            dependencies: Vec::new(),
            requires_approval: false,
            optional: false,
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn depends_on<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<TaskName>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    /// Structural equality of tool, params and dependency set.
    pub fn same_definition(&self, other: &TaskSpec) -> bool {
        let deps = |spec: &TaskSpec| spec.dependencies.iter().cloned().collect::<BTreeSet<_>>();
        self.tool == other.tool && self.params == other.params && deps(self) == deps(other)
    }
}

/// Workflow submitted for execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub tasks: BTreeMap<TaskName, TaskSpec>,
    /// Initial execution context shared by every task
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl WorkflowSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, name: impl Into<TaskName>, spec: TaskSpec) -> Self {
        self.tasks.insert(name.into(), spec);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// Options applied to a single submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Tasks gated on approval in addition to those flagged on the task itself
    pub approval_required: BTreeSet<TaskName>,
    /// Keep the workflow in `Pending` until `continue_run`; falls back to the executor config
    pub hold: Option<bool>,
}

/// Status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status of a task within a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Kind of a recorded task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Timeout,
    MemoryExceeded,
    RuntimeError,
    ValidationError,
    UnknownTool,
    ToolFailed,
    Cancelled,
    ApprovalDenied,
    SkippedDependency,
    /// The enforcement layer itself crashed
    Internal,
}

/// Failure recorded against a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// First fatal failure of a workflow, with the dependents it took down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: TaskName,
    pub error: TaskError,
    pub skipped: Vec<TaskName>,
}

/// Per-task execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
}

impl TaskState {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Snapshot of a workflow as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    pub tasks: BTreeMap<TaskName, TaskState>,
    pub results: BTreeMap<TaskName, Value>,
    pub pending_approval: Option<TaskName>,
    pub failure: Option<TaskFailure>,
    /// Incremented on every replan
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(&TaskName::new(name)).map(|t| t.status)
    }

    pub fn result(&self, name: &str) -> Option<&Value> {
        self.results.get(&TaskName::new(name))
    }
}

/// External decision on an approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}
