use super::dag::TaskGraph;
use super::references;
use crate::config::ReplanPolicy;
use crate::error::ExecutorError;
use crate::events::EventType;
use crate::sandbox::CONTEXT_BINDING;
use crate::types::{
    ApprovalDecision, RetryPolicy, TaskError, TaskErrorKind, TaskFailure, TaskName, TaskState,
    TaskStatus, WorkflowId, WorkflowSpec, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

/// A task handed to the runner
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub task: TaskName,
    pub dispatch_id: u64,
    pub tool: String,
    pub args: Map<String, Value>,
    pub timeout_ms: u64,
    pub retry: Option<RetryPolicy>,
}

/// In-flight task cancelled by a replan
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Superseded {
    pub task: TaskName,
    pub dispatch_id: u64,
}

/// State machine of one workflow.
///
/// Owned by the workflow's coordinator; nothing else mutates it. Transitions
/// buffer events which the coordinator drains and broadcasts.
pub(crate) struct WorkflowRun {
    id: WorkflowId,
    spec: WorkflowSpec,
    graph: TaskGraph,
    status: WorkflowStatus,
    tasks: BTreeMap<TaskName, TaskState>,
    results: BTreeMap<TaskName, Value>,
    /// Ready tasks in dispatch order
    ready: VecDeque<TaskName>,
    in_flight: HashMap<TaskName, u64>,
    next_dispatch_id: u64,
    pending_approval: Option<TaskName>,
    approved: HashSet<TaskName>,
    approval_required: BTreeSet<TaskName>,
    failure: Option<TaskFailure>,
    revision: u32,
    default_timeout_ms: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started: Option<Instant>,
    events: Vec<EventType>,
}

impl WorkflowRun {
    pub fn new(
        id: WorkflowId,
        spec: WorkflowSpec,
        graph: TaskGraph,
        approval_required: BTreeSet<TaskName>,
        default_timeout_ms: u64,
    ) -> Self {
        let now = Utc::now();
        let tasks = spec
            .tasks
            .keys()
            .map(|name| (name.clone(), TaskState::pending()))
            .collect();

        Self {
            id,
            spec,
            graph,
            status: WorkflowStatus::Pending,
            tasks,
            results: BTreeMap::new(),
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            next_dispatch_id: 0,
            pending_approval: None,
            approved: HashSet::new(),
            approval_required,
            failure: None,
            revision: 0,
            default_timeout_ms,
            created_at: now,
            updated_at: now,
            started: None,
            events: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Move a pending workflow to running and queue its entry tasks
    pub fn start(&mut self) {
        if self.status != WorkflowStatus::Pending {
            return;
        }
        self.status = WorkflowStatus::Running;
        self.started = Some(Instant::now());
        self.events.push(EventType::WorkflowStarted {
            task_count: self.spec.tasks.len(),
        });
        tracing::info!(
            "Starting workflow {} with {} tasks",
            self.id,
            self.spec.tasks.len()
        );
        let entries = self.graph.entry_tasks();
        self.enqueue_unblocked(entries);
        self.touch();
    }

    pub fn continue_run(&mut self) -> Result<(), ExecutorError> {
        match self.status {
            WorkflowStatus::Pending => {
                self.start();
                Ok(())
            }
            WorkflowStatus::Running => Ok(()),
            status => Err(self.invalid(status, "continue")),
        }
    }

    /// Take as many ready tasks as `max_in_flight` allows.
    ///
    /// Stops at the first task gated on approval and pauses the workflow.
    pub fn next_dispatches(&mut self, max_in_flight: usize) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        if self.status != WorkflowStatus::Running || self.failure.is_some() {
            return dispatches;
        }

        while self.in_flight.len() < max_in_flight {
            let Some(name) = self.ready.front().cloned() else {
                break;
            };

            if self.requires_approval(&name) && !self.approved.contains(&name) {
                tracing::info!(
                    "Workflow {} paused: task {} awaits approval",
                    self.id,
                    name
                );
                self.status = WorkflowStatus::Paused;
                self.pending_approval = Some(name.clone());
                self.events.push(EventType::WorkflowPaused { task: name });
                break;
            }

            self.ready.pop_front();
            dispatches.push(self.dispatch(name));
        }

        if !dispatches.is_empty() || self.status == WorkflowStatus::Paused {
            self.touch();
        }
        dispatches
    }

    fn dispatch(&mut self, name: TaskName) -> Dispatch {
        let dispatch_id = self.next_dispatch_id;
        self.next_dispatch_id += 1;
        self.in_flight.insert(name.clone(), dispatch_id);

        let task = &self.spec.tasks[&name];
        let dispatch = Dispatch {
            task: name.clone(),
            dispatch_id,
            tool: task.tool.clone(),
            args: self.build_args(&name),
            timeout_ms: task.timeout_ms.unwrap_or(self.default_timeout_ms),
            retry: task.retry.clone(),
        };

        if let Some(state) = self.tasks.get_mut(&name) {
            state.status = TaskStatus::Running;
            state.started_at = Some(Utc::now());
            state.completed_at = None;
            state.error = None;
        }

        tracing::debug!("Dispatching task {} of workflow {}", name, self.id);
        self.events.push(EventType::TaskDispatched {
            task: name,
            tool: dispatch.tool.clone(),
        });
        dispatch
    }

    /// Tool arguments: params with output references resolved, plus the
    /// execution context under [`CONTEXT_BINDING`].
    ///
    /// The context is the workflow context, overlaid with the task's own
    /// `context` param, overlaid with each dependency's output keyed by
    /// dependency name.
    fn build_args(&self, name: &TaskName) -> Map<String, Value> {
        let task = &self.spec.tasks[name];
        let mut args = references::resolve(&task.params, &self.results);

        let mut context = self.spec.context.clone();
        if let Some(Value::Object(own)) = args.remove(CONTEXT_BINDING) {
            context.extend(own);
        }
        for dep in self.graph.dependencies(name) {
            if let Some(output) = self.results.get(&dep) {
                context.insert(dep.0.clone(), output.clone());
            }
        }

        args.insert(CONTEXT_BINDING.to_string(), Value::Object(context));
        args
    }

    /// Apply the outcome of a dispatch. Returns false for superseded dispatches.
    pub fn record_outcome(
        &mut self,
        name: &TaskName,
        dispatch_id: u64,
        attempts: u32,
        result: Result<Value, TaskError>,
    ) -> bool {
        if self.in_flight.get(name) != Some(&dispatch_id) {
            tracing::debug!(
                "Ignoring superseded outcome of task {} in workflow {}",
                name,
                self.id
            );
            return false;
        }
        self.in_flight.remove(name);

        let now = Utc::now();
        let aborted = self.status == WorkflowStatus::Aborted;
        let Some(state) = self.tasks.get_mut(name) else {
            return false;
        };
        state.attempts = attempts;
        state.completed_at = Some(now);
        let duration_ms = state
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        match result {
            Ok(output) => {
                state.status = TaskStatus::Completed;
                state.error = None;
                self.results.insert(name.clone(), output);
                tracing::info!("Task {} of workflow {} completed", name, self.id);
                self.events.push(EventType::TaskCompleted {
                    task: name.clone(),
                    duration_ms,
                });
                if !aborted {
                    let dependents = self.graph.dependents(name);
                    self.enqueue_unblocked(dependents);
                }
            }
            Err(error) if aborted => {
                state.status = TaskStatus::Cancelled;
                state.error = Some(error);
                self.events.push(EventType::TaskCancelled { task: name.clone() });
            }
            Err(error) => {
                state.status = TaskStatus::Failed;
                state.error = Some(error.clone());
                self.events.push(EventType::TaskFailed {
                    task: name.clone(),
                    error: error.clone(),
                });
                let skipped = self.skip_dependents(name);
                self.record_failure(name, error, skipped);
            }
        }

        self.touch();
        true
    }

    pub fn respond_approval(&mut self, decision: ApprovalDecision) -> Result<(), ExecutorError> {
        if self.status != WorkflowStatus::Paused {
            return Err(self.invalid(self.status, "respond to approval for"));
        }
        let Some(name) = self.pending_approval.take() else {
            return Err(self.invalid(self.status, "respond to approval for"));
        };

        self.status = WorkflowStatus::Running;
        self.events.push(EventType::WorkflowResumed {
            task: name.clone(),
            decision: Some(decision),
        });

        match decision {
            ApprovalDecision::Approve => {
                tracing::info!("Task {} of workflow {} approved", name, self.id);
                self.approved.insert(name);
            }
            ApprovalDecision::Deny => {
                tracing::warn!("Task {} of workflow {} denied", name, self.id);
                self.ready.retain(|n| n != &name);
                let error = TaskError::new(TaskErrorKind::ApprovalDenied, "approval denied");
                if let Some(state) = self.tasks.get_mut(&name) {
                    state.status = TaskStatus::Skipped;
                    state.completed_at = Some(Utc::now());
                    state.error = Some(error.clone());
                }
                self.events.push(EventType::TaskSkipped {
                    task: name.clone(),
                    reason: "approval denied".to_string(),
                });

                let skipped = self.skip_dependents(&name);
                let optional = self.spec.tasks.get(&name).is_some_and(|t| t.optional);
                if !optional {
                    self.record_failure(&name, error, skipped);
                }
            }
        }

        self.touch();
        Ok(())
    }

    /// Stop dispatching and mark the workflow aborted. In-flight tasks are
    /// cancelled by the coordinator and recorded as they report back.
    pub fn abort(&mut self, reason: &str) -> Result<(), ExecutorError> {
        if self.status.is_terminal() {
            return Err(self.invalid(self.status, "abort"));
        }
        tracing::warn!("Aborting workflow {}: {}", self.id, reason);
        self.status = WorkflowStatus::Aborted;
        self.pending_approval = None;
        self.ready.clear();
        self.events.push(EventType::WorkflowAborted {
            reason: reason.to_string(),
        });
        self.touch();
        Ok(())
    }

    /// Replace the task graph, keeping compatible results.
    ///
    /// Returns the in-flight dispatches that no longer match the new graph;
    /// the caller cancels them and their outcomes are ignored.
    pub fn replan(
        &mut self,
        spec: WorkflowSpec,
        graph: TaskGraph,
        policy: ReplanPolicy,
    ) -> Result<Vec<Superseded>, ExecutorError> {
        if self.status.is_terminal() {
            return Err(self.invalid(self.status, "replan"));
        }

        let old_spec = std::mem::replace(&mut self.spec, spec);
        self.graph = graph;

        let changed: BTreeSet<TaskName> = self
            .spec
            .tasks
            .iter()
            .filter(|(name, task)| {
                old_spec
                    .tasks
                    .get(*name)
                    .map_or(true, |old| !old.same_definition(task))
            })
            .map(|(name, _)| name.clone())
            .collect();

        let invalid: BTreeSet<TaskName> = match policy {
            ReplanPolicy::Structural => changed.clone(),
            ReplanPolicy::Strict => {
                let mut invalid = changed.clone();
                for name in &changed {
                    invalid.extend(self.graph.descendants(name));
                }
                invalid
            }
            ReplanPolicy::NameOnly => self
                .spec
                .tasks
                .keys()
                .filter(|name| !old_spec.tasks.contains_key(*name))
                .cloned()
                .collect(),
        };
        let compatible =
            |name: &TaskName| self.spec.tasks.contains_key(name) && !invalid.contains(name);

        let mut kept = Vec::new();
        let mut discarded = Vec::new();
        for (name, output) in std::mem::take(&mut self.results) {
            if compatible(&name) {
                kept.push(name.clone());
                self.results.insert(name, output);
            } else {
                discarded.push(name);
            }
        }

        let mut superseded = Vec::new();
        self.in_flight.retain(|name, dispatch_id| {
            let keep = compatible(name);
            if !keep {
                superseded.push(Superseded {
                    task: name.clone(),
                    dispatch_id: *dispatch_id,
                });
            }
            keep
        });

        let mut old_tasks = std::mem::take(&mut self.tasks);
        for name in self.spec.tasks.keys() {
            let carried = self.results.contains_key(name) || self.in_flight.contains_key(name);
            let state = match old_tasks.remove(name) {
                Some(state) if carried => state,
                _ => TaskState::pending(),
            };
            self.tasks.insert(name.clone(), state);
        }

        self.failure = None;
        self.approved
            .retain(|name| self.spec.tasks.contains_key(name) && !changed.contains(name));

        // The gate survives only if the gated task is unchanged and still ready
        let gate = self.pending_approval.take();
        if self.status == WorkflowStatus::Paused {
            match gate {
                Some(gate)
                    if self.spec.tasks.contains_key(&gate)
                        && !changed.contains(&gate)
                        && self.is_unblocked(&gate) =>
                {
                    self.pending_approval = Some(gate);
                }
                Some(gate) => {
                    self.status = WorkflowStatus::Running;
                    self.events.push(EventType::WorkflowResumed {
                        task: gate,
                        decision: None,
                    });
                }
                None => self.status = WorkflowStatus::Running,
            }
        }

        self.ready.clear();
        if self.status != WorkflowStatus::Pending {
            let candidates: Vec<TaskName> = self.spec.tasks.keys().cloned().collect();
            self.enqueue_unblocked(candidates);
            if let Some(gate) = &self.pending_approval {
                self.ready.retain(|n| n != gate);
                self.ready.push_front(gate.clone());
            }
        }

        self.revision += 1;
        tracing::info!(
            "Replanned workflow {} (revision {}): kept {} results, discarded {}",
            self.id,
            self.revision,
            kept.len(),
            discarded.len()
        );
        self.events.push(EventType::WorkflowReplanned {
            revision: self.revision,
            kept,
            discarded,
        });
        self.touch();
        Ok(superseded)
    }

    /// Settle the workflow once nothing is in flight.
    ///
    /// Returns true when the workflow is terminal and the coordinator can stop.
    pub fn finalize(&mut self) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }

        match self.status {
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Aborted => {
                return true
            }
            WorkflowStatus::Pending => return false,
            WorkflowStatus::Paused if self.failure.is_none() => return false,
            WorkflowStatus::Running | WorkflowStatus::Paused => {}
        }

        if let Some(failure) = &self.failure {
            tracing::error!(
                "Workflow {} failed: task {} {}",
                self.id,
                failure.task,
                failure.error
            );
            self.events.push(EventType::WorkflowFailed {
                task: failure.task.clone(),
                error: failure.error.clone(),
            });
            self.status = WorkflowStatus::Failed;
            self.pending_approval = None;
            self.touch();
            return true;
        }

        let finished = self
            .tasks
            .values()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped));
        if finished {
            let duration_ms = self
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            tracing::info!("Workflow {} completed in {} ms", self.id, duration_ms);
            self.events.push(EventType::WorkflowCompleted { duration_ms });
            self.status = WorkflowStatus::Completed;
            self.touch();
            return true;
        }

        if self.ready.is_empty() {
            let stalled = self
                .tasks
                .iter()
                .find(|(_, t)| t.status == TaskStatus::Pending)
                .map(|(name, _)| name.clone());
            if let Some(task) = stalled {
                let error = TaskError::new(TaskErrorKind::Internal, "no runnable tasks remain");
                self.record_failure(&task, error, Vec::new());
                return self.finalize();
            }
        }

        false
    }

    pub fn snapshot(&self) -> WorkflowState {
        WorkflowState {
            id: self.id,
            status: self.status,
            tasks: self.tasks.clone(),
            results: self.results.clone(),
            pending_approval: self.pending_approval.clone(),
            failure: self.failure.clone(),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn drain_events(&mut self) -> Vec<EventType> {
        std::mem::take(&mut self.events)
    }

    fn requires_approval(&self, name: &TaskName) -> bool {
        self.approval_required.contains(name)
            || self.spec.tasks.get(name).is_some_and(|t| t.requires_approval)
    }

    /// Queue every candidate that is pending, not queued, and whose
    /// dependencies have all completed. Candidates are taken in name order.
    fn enqueue_unblocked(&mut self, mut candidates: Vec<TaskName>) {
        candidates.sort();
        candidates.dedup();
        for name in candidates {
            let pending = self
                .tasks
                .get(&name)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if !pending || self.ready.contains(&name) || self.in_flight.contains_key(&name) {
                continue;
            }
            if self.is_unblocked(&name) {
                self.ready.push_back(name);
            }
        }
    }

    fn is_unblocked(&self, name: &TaskName) -> bool {
        self.graph
            .dependencies(name)
            .iter()
            .all(|dep| self.results.contains_key(dep))
    }

    /// Mark every pending transitive dependent of `name` as skipped
    fn skip_dependents(&mut self, name: &TaskName) -> Vec<TaskName> {
        let mut skipped = Vec::new();
        for dependent in self.graph.descendants(name) {
            let Some(state) = self.tasks.get_mut(&dependent) else {
                continue;
            };
            if state.status != TaskStatus::Pending {
                continue;
            }
            state.status = TaskStatus::Skipped;
            state.error = Some(TaskError::new(
                TaskErrorKind::SkippedDependency,
                format!("dependency {} did not complete", name),
            ));
            self.ready.retain(|n| n != &dependent);
            self.events.push(EventType::TaskSkipped {
                task: dependent.clone(),
                reason: format!("dependency {} did not complete", name),
            });
            skipped.push(dependent);
        }
        skipped
    }

    fn record_failure(&mut self, name: &TaskName, error: TaskError, skipped: Vec<TaskName>) {
        if self.failure.is_some() {
            return;
        }
        if error.kind == TaskErrorKind::Internal {
            tracing::error!(
                "Enforcement failure while running task {} of workflow {}: {}",
                name,
                self.id,
                error.message
            );
        } else {
            tracing::warn!("Task {} of workflow {} failed: {}", name, self.id, error);
        }
        self.failure = Some(TaskFailure {
            task: name.clone(),
            error,
            skipped,
        });
    }

    fn invalid(&self, status: WorkflowStatus, operation: &'static str) -> ExecutorError {
        ExecutorError::InvalidState {
            id: self.id,
            status,
            operation,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
