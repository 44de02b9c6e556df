//! The seam between the hub and the agents it dispatches to

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::agent::{AgentKind, AgentRecord};
use crate::aggregator::AggregatedResult;
use crate::error::{CompileError, StoreError};
use crate::execution::ExecutionId;
use crate::orchestrator::{HeldPermit, Hub};
use crate::request::DelegationRequest;
use crate::store::AgentStateStore;

/// Output of a dependency the invoked task waited on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyOutput {
    pub task_id: String,
    pub agent: AgentKind,
    pub output: Value,
}

/// Handle a worker uses to read and write its kind's notes
///
/// Lifecycle fields of the record belong to the hub; this handle only ever
/// touches `notes`.
#[derive(Clone)]
pub struct AgentMemory {
    kind: AgentKind,
    store: Arc<dyn AgentStateStore>,
}

impl AgentMemory {
    pub(crate) fn new(kind: AgentKind, store: Arc<dyn AgentStateStore>) -> Self {
        Self { kind, store }
    }

    pub fn kind(&self) -> &AgentKind {
        &self.kind
    }

    /// Full record, read-only
    pub fn record(&self) -> Result<AgentRecord, StoreError> {
        self.store.get(&self.kind)
    }

    pub fn notes(&self) -> Result<String, StoreError> {
        Ok(self.store.get(&self.kind)?.notes)
    }

    pub fn set_notes(&self, notes: impl Into<String>) -> Result<(), StoreError> {
        let mut notes = Some(notes.into());
        self.store.update(&self.kind, &mut |record| {
            if let Some(notes) = notes.take() {
                record.notes = notes;
            }
        })?;
        Ok(())
    }

    /// Append a line to the notes
    pub fn append_notes(&self, line: &str) -> Result<(), StoreError> {
        self.store.update(&self.kind, &mut |record| {
            if !record.notes.is_empty() {
                record.notes.push('\n');
            }
            record.notes.push_str(line);
        })?;
        Ok(())
    }
}

/// Everything a worker receives for one task
#[derive(Clone)]
pub struct Invocation {
    pub execution_id: ExecutionId,
    pub task_id: String,
    pub agent: AgentKind,
    pub prompt: String,
    pub reason: Option<String>,
    /// Delegation depth this invocation runs at
    pub depth: u32,
    /// Outputs of direct dependencies, in `depends_on` order
    pub dependencies: Vec<DependencyOutput>,
    /// Kinds held by the chain of invocations up to and including this one
    pub lineage: Vec<AgentKind>,
    pub memory: AgentMemory,
    pub(crate) hub: Hub,
    pub(crate) permit: HeldPermit,
}

impl Invocation {
    /// Output of a named dependency
    pub fn dependency(&self, task_id: &str) -> Option<&Value> {
        self.dependencies
            .iter()
            .find(|d| d.task_id == task_id)
            .map(|d| &d.output)
    }

    /// Stamp a request as coming from this invocation
    pub fn nested(&self, request: DelegationRequest) -> DelegationRequest {
        request
            .from_agent(self.agent.clone())
            .at_depth(self.depth)
            .within(self.lineage.clone())
    }

    /// Delegate further work through the hub and wait for it
    ///
    /// Rejected with `NestingExceeded` once the hub's depth limit is reached,
    /// and with `ReentrantDelegation` for a kind anywhere in [`Self::lineage`].
    /// The concurrency permit is given back while waiting.
    pub async fn delegate(
        &self,
        request: DelegationRequest,
    ) -> Result<AggregatedResult, CompileError> {
        let handle = self.hub.submit(self.nested(request))?;
        self.permit.release();
        let result = self.hub.wait(&handle).await;
        self.permit.reacquire().await;
        Ok(result)
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("execution_id", &self.execution_id)
            .field("task_id", &self.task_id)
            .field("agent", &self.agent)
            .field("depth", &self.depth)
            .field("lineage", &self.lineage)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// Something that performs delegated work
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one task; the returned value is opaque to the hub
    async fn invoke(&self, invocation: Invocation) -> anyhow::Result<Value>;
}

/// Routes invocations to per-kind workers
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<AgentKind, Arc<dyn Worker>>,
    fallback: Option<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the worker for a kind, replacing any previous one
    pub fn register(&mut self, kind: AgentKind, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(kind, worker);
        self
    }

    /// Worker used for kinds without a dedicated registration
    pub fn fallback(&mut self, worker: Arc<dyn Worker>) -> &mut Self {
        self.fallback = Some(worker);
        self
    }

    pub fn get(&self, kind: &AgentKind) -> Option<&Arc<dyn Worker>> {
        self.workers.get(kind).or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.fallback.is_none()
    }
}

#[async_trait]
impl Worker for WorkerRegistry {
    async fn invoke(&self, invocation: Invocation) -> anyhow::Result<Value> {
        let worker = self
            .get(&invocation.agent)
            .cloned()
            .ok_or_else(|| anyhow!("no worker registered for agent '{}'", invocation.agent))?;
        worker.invoke(invocation).await
    }
}
