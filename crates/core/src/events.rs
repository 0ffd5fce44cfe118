use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event emitted while a workflow executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl WorkflowEvent {
    pub fn new(workflow_id: WorkflowId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Workflow lifecycle events
    WorkflowStarted {
        task_count: usize,
    },
    WorkflowPaused {
        task: TaskName,
    },
    /// `decision` is `None` when a replan withdrew the approval request
    WorkflowResumed {
        task: TaskName,
        decision: Option<ApprovalDecision>,
    },
    WorkflowReplanned {
        revision: u32,
        kept: Vec<TaskName>,
        discarded: Vec<TaskName>,
    },
    WorkflowCompleted {
        duration_ms: u64,
    },
    WorkflowFailed {
        task: TaskName,
        error: TaskError,
    },
    WorkflowAborted {
        reason: String,
    },

    // Task lifecycle events
    TaskDispatched {
        task: TaskName,
        tool: String,
    },
    TaskCompleted {
        task: TaskName,
        duration_ms: u64,
    },
    TaskFailed {
        task: TaskName,
        error: TaskError,
    },
    TaskRetrying {
        task: TaskName,
        attempt: u32,
        backoff_ms: u64,
        error: TaskError,
    },
    TaskSkipped {
        task: TaskName,
        reason: String,
    },
    TaskCancelled {
        task: TaskName,
    },
}

impl EventType {
    /// Task this event concerns, if any
    pub fn task(&self) -> Option<&TaskName> {
        match self {
            Self::WorkflowPaused { task }
            | Self::WorkflowResumed { task, .. }
            | Self::WorkflowFailed { task, .. }
            | Self::TaskDispatched { task, .. }
            | Self::TaskCompleted { task, .. }
            | Self::TaskFailed { task, .. }
            | Self::TaskRetrying { task, .. }
            | Self::TaskSkipped { task, .. }
            | Self::TaskCancelled { task } => Some(task),
            Self::WorkflowStarted { .. }
            | Self::WorkflowReplanned { .. }
            | Self::WorkflowCompleted { .. }
            | Self::WorkflowAborted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::new(
            WorkflowId::new(),
            EventType::TaskSkipped {
                task: TaskName::new("process"),
                reason: "dependency fetch failed".to_string(),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"]["type"], "task_skipped");
        assert_eq!(json["event_type"]["task"], "process");

        let back: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.event_type.task(), Some(&TaskName::new("process")));
    }
}
