use super::run::Dispatch;
use crate::error::ToolError;
use crate::events::{EventType, WorkflowEvent};
use crate::tools::ToolExecutor;
use crate::types::{TaskError, TaskErrorKind, TaskName, WorkflowId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Final result of one dispatch, after retries
#[derive(Debug)]
pub(crate) struct TaskOutcome {
    pub task: TaskName,
    pub dispatch_id: u64,
    pub attempts: u32,
    pub result: Result<Value, TaskError>,
}

/// Runs dispatched tasks against the tool executor with timeout and retry logic
pub(crate) struct TaskRunner {
    tools: Arc<dyn ToolExecutor>,
    events: broadcast::Sender<WorkflowEvent>,
    cancel_grace: Duration,
}

impl TaskRunner {
    pub fn new(
        tools: Arc<dyn ToolExecutor>,
        events: broadcast::Sender<WorkflowEvent>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            tools,
            events,
            cancel_grace,
        }
    }

    pub async fn run(
        &self,
        workflow_id: WorkflowId,
        dispatch: Dispatch,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let max_attempts = dispatch.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
        let backoff_ms = dispatch.retry.as_ref().map_or(0, |r| r.backoff_ms);
        let mut attempt = 1;

        loop {
            tracing::info!(
                "Executing task {} (attempt {}) for workflow {}",
                dispatch.task,
                attempt,
                workflow_id
            );

            let error = match self.attempt(&dispatch, &cancel).await {
                Ok(output) => return outcome(&dispatch, attempt, Ok(output)),
                Err(error) => error,
            };

            let will_retry =
                attempt < max_attempts && error.is_retryable() && !cancel.is_cancelled();
            if !will_retry {
                return outcome(&dispatch, attempt, Err(TaskError::from(&error)));
            }

            // Exponential backoff
            let delay = backoff_ms.saturating_mul(2_u64.saturating_pow(attempt - 1));
            tracing::info!(
                "Retrying task {} after {} ms (attempt {}): {}",
                dispatch.task,
                delay,
                attempt + 1,
                error
            );
            let _ = self.events.send(WorkflowEvent::new(
                workflow_id,
                EventType::TaskRetrying {
                    task: dispatch.task.clone(),
                    attempt: attempt + 1,
                    backoff_ms: delay,
                    error: TaskError::from(&error),
                },
            ));

            tokio::select! {
                _ = cancel.cancelled() => {
                    let error = TaskError::new(TaskErrorKind::Cancelled, "cancelled during retry backoff");
                    return outcome(&dispatch, attempt, Err(error));
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            attempt += 1;
        }
    }

    /// One tool call bounded by the task timeout.
    ///
    /// On timeout or cancellation the call's token is cancelled and the call
    /// gets `cancel_grace` to wind down before it is dropped.
    async fn attempt(
        &self,
        dispatch: &Dispatch,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let token = cancel.child_token();
        let mut call = self
            .tools
            .execute(&dispatch.tool, dispatch.args.clone(), token.clone());

        tokio::select! {
            result = &mut call => result,
            _ = tokio::time::sleep(Duration::from_millis(dispatch.timeout_ms)) => {
                tracing::warn!("Task {} timed out after {} ms", dispatch.task, dispatch.timeout_ms);
                token.cancel();
                if tokio::time::timeout(self.cancel_grace, &mut call).await.is_err() {
                    tracing::warn!("Task {} ignored cancellation after timeout", dispatch.task);
                }
                Err(ToolError::TimedOut(dispatch.timeout_ms))
            }
            _ = cancel.cancelled() => {
                if tokio::time::timeout(self.cancel_grace, &mut call).await.is_err() {
                    tracing::warn!("Task {} ignored cancellation", dispatch.task);
                }
                Err(ToolError::Cancelled)
            }
        }
    }
}

fn outcome(dispatch: &Dispatch, attempts: u32, result: Result<Value, TaskError>) -> TaskOutcome {
    TaskOutcome {
        task: dispatch.task.clone(),
        dispatch_id: dispatch.dispatch_id,
        attempts,
        result,
    }
}
