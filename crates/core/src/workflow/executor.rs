use super::dag::TaskGraph;
use super::run::WorkflowRun;
use super::task_runner::{TaskOutcome, TaskRunner};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, GraphError};
use crate::events::WorkflowEvent;
use crate::tools::ToolExecutor;
use crate::types::{
    ApprovalDecision, SubmitOptions, TaskError, TaskErrorKind, TaskName, WorkflowId, WorkflowSpec,
    WorkflowState, WorkflowStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

type Reply = oneshot::Sender<Result<WorkflowState, ExecutorError>>;

enum Command {
    Continue(Reply),
    Abort(Reply),
    Replan(Box<(WorkflowSpec, TaskGraph)>, Reply),
    RespondApproval(ApprovalDecision, Reply),
}

#[derive(Clone)]
struct RunHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WorkflowState>,
}

/// Executes workflows as dependency graphs of tool calls.
///
/// Each submitted workflow gets its own coordinator task which owns the
/// workflow's state; callers talk to it over a command channel and read
/// published snapshots.
pub struct WorkflowExecutor {
    tools: Arc<dyn ToolExecutor>,
    config: ExecutorConfig,
    runs: Arc<RwLock<HashMap<WorkflowId, RunHandle>>>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowExecutor {
    pub fn new(tools: Arc<dyn ToolExecutor>, config: ExecutorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            tools,
            config,
            runs: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Validate and start a workflow
    pub async fn submit(&self, spec: WorkflowSpec) -> Result<WorkflowId, ExecutorError> {
        self.submit_with(spec, SubmitOptions::default()).await
    }

    pub async fn submit_with(
        &self,
        spec: WorkflowSpec,
        options: SubmitOptions,
    ) -> Result<WorkflowId, ExecutorError> {
        let graph = TaskGraph::from_spec(&spec)?;
        if let Some(unknown) = options
            .approval_required
            .iter()
            .find(|name| !spec.tasks.contains_key(*name))
        {
            return Err(GraphError::Validation(format!(
                "approval requested for unknown task {}",
                unknown
            ))
            .into());
        }

        let id = WorkflowId::new();
        let task_count = spec.tasks.len();
        let mut run = WorkflowRun::new(
            id,
            spec,
            graph,
            options.approval_required,
            self.config.task_timeout_ms,
        );
        let hold = options.hold.unwrap_or(self.config.hold_on_submit);
        if !hold {
            run.start();
        }

        let (state_tx, state_rx) = watch::channel(run.snapshot());
        let (command_tx, command_rx) = mpsc::channel(16);
        let runner = Arc::new(TaskRunner::new(
            self.tools.clone(),
            self.events.clone(),
            Duration::from_millis(self.config.cancel_grace_ms),
        ));

        let coordinator = Coordinator {
            id,
            run,
            runner,
            config: self.config.clone(),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            task_ids: HashMap::new(),
            task_tokens: HashMap::new(),
            state: state_tx,
            events: self.events.clone(),
            replies: Vec::new(),
        };
        tokio::spawn(coordinator.drive(command_rx));

        self.runs.write().await.insert(
            id,
            RunHandle {
                commands: command_tx,
                state: state_rx,
            },
        );

        tracing::info!(
            "Submitted workflow {} with {} tasks{}",
            id,
            task_count,
            if hold { " (held)" } else { "" }
        );
        Ok(id)
    }

    /// Latest snapshot of a workflow
    pub async fn status(&self, id: WorkflowId) -> Result<WorkflowState, ExecutorError> {
        let handle = self.handle(id).await?;
        let state = handle.state.borrow().clone();
        Ok(state)
    }

    /// Start a held workflow. A running workflow is left as is.
    pub async fn continue_run(&self, id: WorkflowId) -> Result<WorkflowState, ExecutorError> {
        self.send(id, "continue", Command::Continue).await
    }

    pub async fn abort(&self, id: WorkflowId) -> Result<WorkflowState, ExecutorError> {
        self.send(id, "abort", Command::Abort).await
    }

    /// Replace the workflow's graph, keeping results the replan policy
    /// considers still valid
    pub async fn replan(
        &self,
        id: WorkflowId,
        spec: WorkflowSpec,
    ) -> Result<WorkflowState, ExecutorError> {
        let graph = TaskGraph::from_spec(&spec)?;
        self.send(id, "replan", |reply| {
            Command::Replan(Box::new((spec, graph)), reply)
        })
        .await
    }

    pub async fn respond_approval(
        &self,
        id: WorkflowId,
        decision: ApprovalDecision,
    ) -> Result<WorkflowState, ExecutorError> {
        self.send(id, "respond to approval for", |reply| {
            Command::RespondApproval(decision, reply)
        })
        .await
    }

    /// Wait until the workflow needs attention: terminal, paused on an
    /// approval, or held before start
    pub async fn wait(&self, id: WorkflowId) -> Result<WorkflowState, ExecutorError> {
        let mut state = self.handle(id).await?.state;
        let settled = state
            .wait_for(|s| {
                s.status.is_terminal()
                    || matches!(s.status, WorkflowStatus::Paused | WorkflowStatus::Pending)
            })
            .await
            .map(|s| s.clone());

        match settled {
            Ok(state) => Ok(state),
            // Coordinator gone; the last published snapshot is final
            Err(_) => Ok(state.borrow().clone()),
        }
    }

    /// Snapshots of every known workflow, oldest first
    pub async fn list(&self) -> Vec<WorkflowState> {
        let runs = self.runs.read().await;
        let mut states: Vec<WorkflowState> =
            runs.values().map(|h| h.state.borrow().clone()).collect();
        states.sort_by_key(|s| s.created_at);
        states
    }

    /// Drop a terminal workflow from the executor
    pub async fn forget(&self, id: WorkflowId) -> Result<WorkflowState, ExecutorError> {
        let mut runs = self.runs.write().await;
        let handle = runs.get(&id).ok_or(ExecutorError::NotFound(id))?;
        let state = handle.state.borrow().clone();
        if !state.status.is_terminal() {
            return Err(ExecutorError::InvalidState {
                id,
                status: state.status,
                operation: "forget",
            });
        }
        runs.remove(&id);
        Ok(state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    async fn handle(&self, id: WorkflowId) -> Result<RunHandle, ExecutorError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ExecutorError::NotFound(id))
    }

    async fn send(
        &self,
        id: WorkflowId,
        operation: &'static str,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<WorkflowState, ExecutorError> {
        let handle = self.handle(id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.commands.send(command(reply_tx)).await.is_err() {
            return Err(stopped(id, &handle, operation));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(stopped(id, &handle, operation)))
    }
}

/// Error for a command that reached a coordinator which already exited
fn stopped(id: WorkflowId, handle: &RunHandle, operation: &'static str) -> ExecutorError {
    let status = handle.state.borrow().status;
    if status.is_terminal() {
        ExecutorError::InvalidState {
            id,
            status,
            operation,
        }
    } else {
        ExecutorError::Closed(id)
    }
}

struct Coordinator {
    id: WorkflowId,
    run: WorkflowRun,
    runner: Arc<TaskRunner>,
    config: ExecutorConfig,
    cancel: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
    task_ids: HashMap<tokio::task::Id, (TaskName, u64)>,
    task_tokens: HashMap<u64, CancellationToken>,
    state: watch::Sender<WorkflowState>,
    events: broadcast::Sender<WorkflowEvent>,
    replies: Vec<(Reply, Result<(), ExecutorError>)>,
}

impl Coordinator {
    async fn drive(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            self.dispatch_ready();
            // Superseded tasks still winding down keep the workflow open
            let done = self.tasks.is_empty() && self.run.finalize();
            self.publish();
            self.flush_replies();
            if done {
                break;
            }

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        if self.run.abort("executor dropped").is_ok() {
                            self.cancel_and_drain().await;
                        }
                    }
                },
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined);
                }
            }
        }

        tracing::debug!("Coordinator for workflow {} stopped", self.id);
    }

    /// Superseded tasks count against the concurrency limit until joined
    fn dispatch_ready(&mut self) {
        let draining = self.tasks.len().saturating_sub(self.run.in_flight());
        let limit = self.config.max_concurrent_tasks.saturating_sub(draining);
        for dispatch in self.run.next_dispatches(limit) {
            let token = self.cancel.child_token();
            let runner = self.runner.clone();
            let id = self.id;
            let task = dispatch.task.clone();
            let dispatch_id = dispatch.dispatch_id;
            self.task_tokens.insert(dispatch_id, token.clone());

            let handle = self
                .tasks
                .spawn(async move { runner.run(id, dispatch, token).await });
            self.task_ids.insert(handle.id(), (task, dispatch_id));
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Continue(reply) => {
                let result = self.run.continue_run();
                self.replies.push((reply, result));
            }
            Command::Abort(reply) => {
                let result = self.run.abort("abort requested");
                if result.is_ok() {
                    self.publish();
                    self.cancel_and_drain().await;
                }
                self.replies.push((reply, result));
            }
            Command::Replan(replacement, reply) => {
                let (spec, graph) = *replacement;
                let result = self
                    .run
                    .replan(spec, graph, self.config.replan_policy)
                    .map(|superseded| {
                        for entry in superseded {
                            tracing::info!(
                                "Cancelling superseded task {} of workflow {}",
                                entry.task,
                                self.id
                            );
                            if let Some(token) = self.task_tokens.remove(&entry.dispatch_id) {
                                token.cancel();
                            }
                        }
                    });
                self.replies.push((reply, result));
            }
            Command::RespondApproval(decision, reply) => {
                let result = self.run.respond_approval(decision);
                self.replies.push((reply, result));
            }
        }
    }

    fn handle_joined(&mut self, joined: Result<(tokio::task::Id, TaskOutcome), JoinError>) {
        match joined {
            Ok((task_id, outcome)) => {
                self.task_ids.remove(&task_id);
                self.task_tokens.remove(&outcome.dispatch_id);
                self.run.record_outcome(
                    &outcome.task,
                    outcome.dispatch_id,
                    outcome.attempts,
                    outcome.result,
                );
            }
            Err(join_error) => {
                let Some((task, dispatch_id)) = self.task_ids.remove(&join_error.id()) else {
                    return;
                };
                self.task_tokens.remove(&dispatch_id);
                let error = if join_error.is_cancelled() {
                    TaskError::new(TaskErrorKind::Cancelled, "task aborted")
                } else {
                    tracing::error!(
                        "Task {} of workflow {} panicked: {}",
                        task,
                        self.id,
                        join_error
                    );
                    TaskError::new(TaskErrorKind::Internal, "task runner panicked")
                };
                self.run.record_outcome(&task, dispatch_id, 1, Err(error));
            }
        }
    }

    /// Cancel every in-flight task and collect their outcomes. Tasks that
    /// ignore cancellation past the grace period are aborted.
    async fn cancel_and_drain(&mut self) {
        self.cancel.cancel();
        let grace = Duration::from_millis(self.config.cancel_grace_ms.saturating_mul(2).max(10));

        loop {
            match tokio::time::timeout(grace, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => self.handle_joined(joined),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "{} tasks of workflow {} ignored cancellation; aborting them",
                        self.tasks.len(),
                        self.id
                    );
                    self.tasks.abort_all();
                }
            }
        }
    }

    fn publish(&mut self) {
        for event_type in self.run.drain_events() {
            // No subscribers is fine
            let _ = self.events.send(WorkflowEvent::new(self.id, event_type));
        }
        self.state.send_replace(self.run.snapshot());
    }

    fn flush_replies(&mut self) {
        if self.replies.is_empty() {
            return;
        }
        let snapshot = self.run.snapshot();
        for (reply, result) in self.replies.drain(..) {
            let _ = reply.send(result.map(|()| snapshot.clone()));
        }
    }
}
