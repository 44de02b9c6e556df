//! Lifecycle events emitted by the hub

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::agent::{AgentKind, AgentStatus};
use crate::aggregator::AggregateStatus;
use crate::execution::{ExecutionId, TaskState};

/// Something observers may want to know about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    /// A request compiled and its driver started
    ExecutionStarted {
        execution_id: ExecutionId,
        tasks: usize,
        waves: usize,
    },
    /// A task moved to a new state
    TaskStateChanged {
        execution_id: ExecutionId,
        task_id: String,
        agent: AgentKind,
        state: TaskState,
    },
    /// An agent record's lifecycle status changed
    AgentStatusChanged { agent: AgentKind, status: AgentStatus },
    /// A running invocation finished after its task was already terminal
    ResultDiscarded {
        execution_id: ExecutionId,
        task_id: String,
    },
    /// Every task is terminal and the result is ready for its recipient
    ExecutionFinished {
        execution_id: ExecutionId,
        status: AggregateStatus,
        return_to: Option<AgentKind>,
    },
}

/// Client side of the hub's event stream
#[derive(Clone)]
pub struct HubChannel {
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<HubEvent>>>,
}

impl HubChannel {
    /// Create a new channel pair
    ///
    /// Returns the client channel and the sender the hub emits into
    pub fn new() -> (Self, mpsc::UnboundedSender<HubEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = Self {
            event_rx: Arc::new(Mutex::new(event_rx)),
        };
        (channel, event_tx)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<HubEvent> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Receive the next event, or `None` once the hub is gone
    pub async fn recv(&self) -> Option<HubEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Drain everything currently buffered
    pub fn drain(&self) -> Vec<HubEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
