//! The hub - compiles delegation requests and drives them to completion

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentKind, AgentRecord, AgentStatus};
use crate::aggregator::AggregatedResult;
use crate::channel::{HubChannel, HubEvent};
use crate::config::HubConfig;
use crate::error::{CompileError, HubError, TaskFailure};
use crate::execution::{Execution, ExecutionHandle, ExecutionId, ExecutionSnapshot, TaskState};
use crate::graph::{self, CompileLimits};
use crate::request::DelegationRequest;
use crate::store::AgentStateStore;
use crate::worker::{AgentMemory, DependencyOutput, Invocation, Worker};

/// One slot per agent kind, shared by every execution
///
/// A second task for a busy kind queues behind the first (FIFO), whether it
/// comes from the same wave or from another request.
#[derive(Default)]
struct AgentSlots {
    slots: Mutex<HashMap<AgentKind, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentSlots {
    async fn acquire(&self, kind: &AgentKind) -> OwnedMutexGuard<()> {
        let slot = Arc::clone(self.slots.lock().entry(kind.clone()).or_default());
        slot.lock_owned().await
    }
}

/// Global concurrency permit of one running invocation
///
/// Given back while the invocation waits on a nested delegation, so the nested
/// tasks can run under any `max_concurrency`.
#[derive(Clone)]
pub(crate) struct HeldPermit {
    permits: Arc<Semaphore>,
    held: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl HeldPermit {
    async fn acquire(permits: Arc<Semaphore>) -> Option<Self> {
        let permit = Arc::clone(&permits).acquire_owned().await.ok()?;
        Some(Self {
            permits,
            held: Arc::new(Mutex::new(Some(permit))),
        })
    }

    pub(crate) fn release(&self) {
        self.held.lock().take();
    }

    pub(crate) async fn reacquire(&self) {
        if let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await {
            *self.held.lock() = Some(permit);
        }
    }
}

/// Outcome of [`Hub::delegate`]
#[derive(Debug)]
pub enum Delegation {
    /// Blocking request, already finished
    Completed(AggregatedResult),
    /// Non-blocking request, still running
    Detached(ExecutionHandle),
}

struct HubInner {
    config: HubConfig,
    limits: CompileLimits,
    store: Arc<dyn AgentStateStore>,
    worker: Arc<dyn Worker>,
    slots: AgentSlots,
    permits: Arc<Semaphore>,
    executions: RwLock<HashMap<ExecutionId, ExecutionHandle>>,
    event_tx: Option<mpsc::UnboundedSender<HubEvent>>,
}

/// The delegation hub
///
/// Sole writer of task and agent lifecycle state. Cheap to clone; clones
/// share executions, slots and the store.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").finish_non_exhaustive()
    }
}

impl Hub {
    /// Create a hub whose store is opened from `config.state_dir`
    pub fn new(config: HubConfig, worker: Arc<dyn Worker>) -> Result<Self, HubError> {
        config.validate()?;
        let store = config.open_store()?;
        Ok(Self::build(config, worker, store, None))
    }

    /// Create a hub over an existing store
    pub fn with_store(
        config: HubConfig,
        worker: Arc<dyn Worker>,
        store: Arc<dyn AgentStateStore>,
    ) -> Self {
        Self::build(config, worker, store, None)
    }

    /// Create a hub and return a channel of its lifecycle events
    pub fn with_channel(
        config: HubConfig,
        worker: Arc<dyn Worker>,
        store: Arc<dyn AgentStateStore>,
    ) -> (Self, HubChannel) {
        let (channel, event_tx) = HubChannel::new();
        (Self::build(config, worker, store, Some(event_tx)), channel)
    }

    fn build(
        config: HubConfig,
        worker: Arc<dyn Worker>,
        store: Arc<dyn AgentStateStore>,
        event_tx: Option<mpsc::UnboundedSender<HubEvent>>,
    ) -> Self {
        let permits = config
            .max_concurrency
            .unwrap_or(Semaphore::MAX_PERMITS)
            .clamp(1, Semaphore::MAX_PERMITS);

        info!(
            max_depth = config.max_depth,
            max_concurrency = ?config.max_concurrency,
            "Creating delegation hub"
        );

        Self {
            inner: Arc::new(HubInner {
                limits: config.compile_limits(),
                config,
                store,
                worker,
                slots: AgentSlots::default(),
                permits: Arc::new(Semaphore::new(permits)),
                executions: RwLock::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn AgentStateStore> {
        &self.inner.store
    }

    /// Compile a request and start executing it
    ///
    /// Fails synchronously on a compile error, before any agent record is
    /// touched. Must be called from within a tokio runtime.
    #[instrument(skip(self, request), fields(mode = ?request.mode, tasks = request.tasks.len()))]
    pub fn submit(&self, request: DelegationRequest) -> Result<ExecutionHandle, CompileError> {
        let graph = graph::compile(&request, &self.inner.limits).map_err(|e| {
            warn!(error = %e, "Rejected delegation request");
            e
        })?;

        let handle = ExecutionHandle::new(Execution::new(graph, CancellationToken::new()));
        self.inner
            .executions
            .write()
            .insert(handle.id(), handle.clone());

        self.emit(HubEvent::ExecutionStarted {
            execution_id: handle.id(),
            tasks: handle.graph().len(),
            waves: handle.graph().waves().len(),
        });

        for node in handle.graph().nodes() {
            self.update_agent(&node.spec.agent, |record| {
                if !record.is_busy() {
                    record.status = AgentStatus::Blocked;
                }
            });
        }

        info!(
            execution_id = %handle.id(),
            requester = ?handle.graph().requesting_agent(),
            depth = handle.graph().depth(),
            "Submitted delegation"
        );

        let hub = self.clone();
        let driven = handle.clone();
        tokio::spawn(async move { hub.drive(driven).await });

        Ok(handle)
    }

    /// Current per-task states; never blocks on running work
    pub fn status(&self, handle: &ExecutionHandle) -> ExecutionSnapshot {
        handle.snapshot()
    }

    /// Stop dispatching and fail every task that has not finished
    ///
    /// Invocations already running are left to finish; their results are
    /// discarded.
    #[instrument(skip(self, handle), fields(execution_id = %handle.id()))]
    pub fn cancel(&self, handle: &ExecutionHandle) {
        handle.cancel_token().cancel();
        let changed = handle.fail_remaining(TaskFailure::Cancelled);
        info!(cancelled = changed.len(), "Cancelled delegation");
        for (idx, previous) in changed {
            self.after_transition(handle, idx, &previous, &TaskState::Failed(TaskFailure::Cancelled));
        }
    }

    /// Suspend until every task is terminal, then aggregate
    ///
    /// Task failures never surface as errors here; inspect the result's status.
    pub async fn wait(&self, handle: &ExecutionHandle) -> AggregatedResult {
        handle.finished().await;
        handle.aggregate()
    }

    /// Submit, then wait if the request is blocking
    pub async fn delegate(&self, request: DelegationRequest) -> Result<Delegation, CompileError> {
        let blocking = request.blocking;
        let handle = self.submit(request)?;
        if blocking {
            Ok(Delegation::Completed(self.wait(&handle).await))
        } else {
            Ok(Delegation::Detached(handle))
        }
    }

    /// Look up an execution whose driver is still running
    pub fn execution(&self, id: &ExecutionId) -> Option<ExecutionHandle> {
        self.inner.executions.read().get(id).cloned()
    }

    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.inner.executions.read().keys().copied().collect()
    }

    /// Walk the waves in order, running each to completion before the next
    async fn drive(self, handle: ExecutionHandle) {
        let cancel = handle.cancel_token().clone();

        'waves: for (n, wave) in handle.graph().waves().iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            debug!(execution_id = %handle.id(), wave = n, size = wave.len(), "Dispatching wave");

            let mut join_set = JoinSet::new();
            for &idx in wave {
                if handle.has_failed_dependency(idx) {
                    self.set_state(&handle, idx, TaskState::Failed(TaskFailure::UpstreamFailure));
                    continue;
                }
                if !self.set_state(&handle, idx, TaskState::Ready) {
                    continue;
                }
                let hub = self.clone();
                let task = handle.clone();
                join_set.spawn(async move { hub.run_task(task, idx).await });
            }

            loop {
                tokio::select! {
                    joined = join_set.join_next() => match joined {
                        Some(Ok(())) => {}
                        Some(Err(e)) => error!(error = %e, "Task driver failed"),
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        // Running invocations finish on their own; results are dropped
                        join_set.detach_all();
                        break 'waves;
                    }
                }
            }
        }

        for (idx, previous) in handle.fail_remaining(TaskFailure::Cancelled) {
            self.after_transition(&handle, idx, &previous, &TaskState::Failed(TaskFailure::Cancelled));
        }

        self.inner.executions.write().remove(&handle.id());

        let result = handle.aggregate();
        info!(
            execution_id = %handle.id(),
            status = ?result.status,
            succeeded = result.succeeded,
            failed = result.failed,
            return_to = ?result.return_to,
            "Delegation finished"
        );
        self.emit(HubEvent::ExecutionFinished {
            execution_id: handle.id(),
            status: result.status,
            return_to: result.return_to,
        });
    }

    /// Run one ready task: take the kind's slot, a global permit, then invoke
    async fn run_task(self, handle: ExecutionHandle, idx: usize) {
        let spec = handle.graph().node(idx).spec.clone();
        let cancel = handle.cancel_token().clone();

        let _slot = tokio::select! {
            slot = self.inner.slots.acquire(&spec.agent) => slot,
            _ = cancel.cancelled() => return,
        };
        let Some(permit) = HeldPermit::acquire(Arc::clone(&self.inner.permits)).await else {
            return;
        };

        if !self.set_state(&handle, idx, TaskState::Running) {
            return;
        }

        let dependencies = handle
            .dependency_outputs(idx)
            .into_iter()
            .map(|(d, output)| {
                let dep = &handle.graph().node(d).spec;
                DependencyOutput {
                    task_id: dep.id.clone(),
                    agent: dep.agent.clone(),
                    output,
                }
            })
            .collect();

        let mut lineage = handle.graph().lineage().to_vec();
        lineage.push(spec.agent.clone());

        let invocation = Invocation {
            execution_id: handle.id(),
            task_id: spec.id.clone(),
            agent: spec.agent.clone(),
            prompt: spec.prompt.clone(),
            reason: spec.reason.clone(),
            depth: handle.graph().depth(),
            dependencies,
            lineage,
            memory: AgentMemory::new(spec.agent.clone(), Arc::clone(&self.inner.store)),
            hub: self.clone(),
            permit: permit.clone(),
        };

        let timeout = spec.timeout.or_else(|| self.inner.config.default_task_timeout());
        debug!(task_id = %spec.id, agent = %spec.agent, ?timeout, "Invoking worker");

        let outcome = self.invoke(invocation, timeout).await;
        permit.release();

        let applied = match outcome {
            Ok(output) => {
                let applied = handle.succeed(idx, output);
                if applied {
                    self.after_transition(&handle, idx, &TaskState::Running, &TaskState::Succeeded);
                }
                applied
            }
            Err(failure) => {
                warn!(task_id = %spec.id, agent = %spec.agent, error = %failure, "Task failed");
                self.set_state(&handle, idx, TaskState::Failed(failure))
            }
        };

        if !applied {
            debug!(task_id = %spec.id, "Discarding result of finished task");
            self.update_agent(&spec.agent, |record| {
                if record.current_task_id.as_deref() == Some(spec.id.as_str()) {
                    record.status = AgentStatus::Idle;
                    record.current_task_id = None;
                }
            });
            self.emit(HubEvent::ResultDiscarded {
                execution_id: handle.id(),
                task_id: spec.id,
            });
        }
    }

    /// Call the worker in its own task so a panic or deadline becomes a task failure
    async fn invoke(
        &self,
        invocation: Invocation,
        timeout: Option<Duration>,
    ) -> Result<Value, TaskFailure> {
        let worker = Arc::clone(&self.inner.worker);
        let mut call = tokio::spawn(async move { worker.invoke(invocation).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut call).await {
                Ok(joined) => joined,
                Err(_) => {
                    call.abort();
                    return Err(TaskFailure::Timeout);
                }
            },
            None => call.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskFailure::WorkerError(format!("{e:#}"))),
            Err(e) => Err(TaskFailure::WorkerError(format!("worker aborted: {e}"))),
        }
    }

    /// Apply a transition and its side effects; `false` if it was not legal
    fn set_state(&self, handle: &ExecutionHandle, idx: usize, next: TaskState) -> bool {
        let previous = handle.state(idx);
        if !handle.transition(idx, next.clone()) {
            return false;
        }
        self.after_transition(handle, idx, &previous, &next);
        true
    }

    /// Mirror a task transition into its agent record and the event stream
    fn after_transition(
        &self,
        handle: &ExecutionHandle,
        idx: usize,
        previous: &TaskState,
        next: &TaskState,
    ) {
        let spec = &handle.graph().node(idx).spec;
        debug!(
            execution_id = %handle.id(),
            task_id = %spec.id,
            from = ?previous,
            to = ?next,
            "Task transition"
        );

        let task_id = spec.id.as_str();
        match next {
            TaskState::Running => self.update_agent(&spec.agent, |record| {
                record.status = AgentStatus::Running;
                record.current_task_id = Some(task_id.to_string());
            }),
            TaskState::Succeeded => self.update_agent(&spec.agent, |record| {
                record.status = AgentStatus::Done;
                record.current_task_id = None;
            }),
            TaskState::Failed(TaskFailure::WorkerError(_) | TaskFailure::Timeout) => {
                self.update_agent(&spec.agent, |record| {
                    record.status = AgentStatus::Failed;
                    record.current_task_id = None;
                })
            }
            // The invocation keeps the kind busy until it returns
            TaskState::Failed(_) if *previous == TaskState::Running => {}
            TaskState::Failed(_) => self.update_agent(&spec.agent, |record| {
                if !record.is_busy() {
                    record.status = AgentStatus::Idle;
                }
            }),
            // Dispatched, waiting on the kind's slot
            TaskState::Ready => self.update_agent(&spec.agent, |record| {
                if !record.is_busy() {
                    record.status = AgentStatus::Blocked;
                }
            }),
            TaskState::Pending => {}
        }

        self.emit(HubEvent::TaskStateChanged {
            execution_id: handle.id(),
            task_id: spec.id.clone(),
            agent: spec.agent.clone(),
            state: next.clone(),
        });
    }

    /// Update an agent record; store failures are logged, never fatal
    fn update_agent(&self, kind: &AgentKind, mut mutate: impl FnMut(&mut AgentRecord)) {
        let mut previous = None;
        let result = self.inner.store.update(kind, &mut |record| {
            previous = Some(record.status);
            mutate(record);
        });
        match result {
            Ok(record) if previous != Some(record.status) => {
                self.emit(HubEvent::AgentStatusChanged {
                    agent: kind.clone(),
                    status: record.status,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(agent = %kind, error = %e, "Failed to update agent record"),
        }
    }

    fn emit(&self, event: HubEvent) {
        if let Some(tx) = &self.inner.event_tx {
            let _ = tx.send(event);
        }
    }
}
