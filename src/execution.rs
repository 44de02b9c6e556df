//! Per-request execution context
//!
//! An [`Execution`] tracks one in-flight delegation: its compiled graph, the
//! state and output of every task, and the cancellation flag. It is owned by
//! the hub and never shared between requests.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentKind;
use crate::aggregator::{self, AggregatedResult, TaskOutcome};
use crate::error::TaskFailure;
use crate::graph::Graph;

/// Unique id of one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task within an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed(TaskFailure),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed(_))
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Ready) => true,
            (TaskState::Ready, TaskState::Running) => true,
            (TaskState::Running, TaskState::Succeeded) => true,
            (current, TaskState::Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct TaskEntry {
    state: TaskState,
    output: Option<Value>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub agent: AgentKind,
    #[serde(flatten)]
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of an execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub tasks: Vec<TaskSnapshot>,
    pub cancelled: bool,
    pub finished: bool,
}

impl ExecutionSnapshot {
    pub fn state_of(&self, task_id: &str) -> Option<&TaskState> {
        self.tasks
            .iter()
            .find(|t| t.task_id == task_id)
            .map(|t| &t.state)
    }
}

/// One in-flight delegation request
pub struct Execution {
    pub id: ExecutionId,
    graph: Graph,
    tasks: RwLock<Vec<TaskEntry>>,
    cancel: CancellationToken,
    finished_tx: watch::Sender<bool>,
    pub submitted_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(graph: Graph, cancel: CancellationToken) -> Self {
        let tasks = (0..graph.len())
            .map(|_| TaskEntry {
                state: TaskState::Pending,
                output: None,
                started_at: None,
                finished_at: None,
            })
            .collect();
        let (finished_tx, _) = watch::channel(false);

        Self {
            id: ExecutionId::new(),
            graph,
            tasks: RwLock::new(tasks),
            cancel,
            finished_tx,
            submitted_at: Utc::now(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn state(&self, idx: usize) -> TaskState {
        self.tasks.read()[idx].state.clone()
    }

    pub fn output(&self, idx: usize) -> Option<Value> {
        self.tasks.read()[idx].output.clone()
    }

    /// Apply a transition if it is legal from the current state
    ///
    /// Returns `false` when the task is already terminal or the move is not
    /// allowed; the caller then drops whatever result it was holding.
    pub fn transition(&self, idx: usize, next: TaskState) -> bool {
        let applied = {
            let mut tasks = self.tasks.write();
            let entry = &mut tasks[idx];
            if !entry.state.can_transition_to(&next) {
                false
            } else {
                match &next {
                    TaskState::Running => entry.started_at = Some(Utc::now()),
                    state if state.is_terminal() => entry.finished_at = Some(Utc::now()),
                    _ => {}
                }
                entry.state = next;
                true
            }
        };
        if applied {
            self.notify_if_finished();
        }
        applied
    }

    /// Record a successful result; discarded if the task is no longer running
    pub fn succeed(&self, idx: usize, output: Value) -> bool {
        let applied = {
            let mut tasks = self.tasks.write();
            let entry = &mut tasks[idx];
            if entry.state != TaskState::Running {
                false
            } else {
                entry.state = TaskState::Succeeded;
                entry.output = Some(output);
                entry.finished_at = Some(Utc::now());
                true
            }
        };
        if applied {
            self.notify_if_finished();
        }
        applied
    }

    /// Fail every non-terminal task
    ///
    /// Returns the index and previous state of each task that changed.
    pub fn fail_remaining(&self, failure: TaskFailure) -> Vec<(usize, TaskState)> {
        let changed: Vec<(usize, TaskState)> = {
            let mut tasks = self.tasks.write();
            let now = Utc::now();
            tasks
                .iter_mut()
                .enumerate()
                .filter(|(_, entry)| !entry.state.is_terminal())
                .map(|(idx, entry)| {
                    let previous =
                        std::mem::replace(&mut entry.state, TaskState::Failed(failure.clone()));
                    entry.finished_at = Some(now);
                    (idx, previous)
                })
                .collect()
        };
        self.notify_if_finished();
        changed
    }

    /// Whether any dependency of the task ended in failure
    pub fn has_failed_dependency(&self, idx: usize) -> bool {
        let tasks = self.tasks.read();
        self.graph
            .node(idx)
            .deps
            .iter()
            .any(|&d| matches!(tasks[d].state, TaskState::Failed(_)))
    }

    /// Outputs of a task's direct dependencies, in `depends_on` order
    pub fn dependency_outputs(&self, idx: usize) -> Vec<(usize, Value)> {
        let tasks = self.tasks.read();
        self.graph
            .node(idx)
            .deps
            .iter()
            .filter_map(|&d| tasks[d].output.clone().map(|out| (d, out)))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.read().iter().all(|t| t.state.is_terminal())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn outcomes(&self) -> Vec<TaskOutcome> {
        self.tasks
            .read()
            .iter()
            .map(|entry| match &entry.state {
                TaskState::Succeeded => {
                    TaskOutcome::Succeeded(entry.output.clone().unwrap_or(Value::Null))
                }
                TaskState::Failed(failure) => TaskOutcome::Failed(failure.clone()),
                _ => TaskOutcome::Pending,
            })
            .collect()
    }

    pub fn aggregate(&self) -> AggregatedResult {
        aggregator::aggregate(&self.graph, &self.outcomes())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let tasks = self.tasks.read();
        let snapshots = self
            .graph
            .nodes()
            .iter()
            .zip(tasks.iter())
            .map(|(node, entry)| TaskSnapshot {
                task_id: node.spec.id.clone(),
                agent: node.spec.agent.clone(),
                state: entry.state.clone(),
                started_at: entry.started_at,
                finished_at: entry.finished_at,
            })
            .collect();
        let finished = tasks.iter().all(|t| t.state.is_terminal());

        ExecutionSnapshot {
            execution_id: self.id,
            tasks: snapshots,
            cancelled: self.cancel.is_cancelled(),
            finished,
        }
    }

    /// Suspend until every task is terminal
    pub async fn finished(&self) {
        let mut rx = self.finished_tx.subscribe();
        // Sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|done| *done).await;
    }

    fn notify_if_finished(&self) {
        if self.is_finished() {
            self.finished_tx.send_replace(true);
        }
    }
}

/// Handle to a submitted execution
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<Execution>,
}

impl ExecutionHandle {
    pub fn new(execution: Execution) -> Self {
        Self {
            inner: Arc::new(execution),
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.inner.id
    }
}

impl std::ops::Deref for ExecutionHandle {
    type Target = Execution;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle").field("id", &self.inner.id).finish()
    }
}
