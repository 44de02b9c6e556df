//! Result aggregation
//!
//! Folds per-task outcomes into the structure handed back to the requester.
//! Entries follow declaration order, never completion order, so the same
//! outcomes always produce the same bytes.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentKind;
use crate::error::TaskFailure;
use crate::graph::Graph;

/// Per-task outcome as seen by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Pending,
    Succeeded(Value),
    Failed(TaskFailure),
}

/// Overall status of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Success,
    PartialFailure,
    Failure,
}

/// Final status of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Succeeded,
    Failed,
}

/// One task's line in the aggregated result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEntry {
    pub task_id: String,
    pub agent: AgentKind,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

/// Where an aggregated result is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Agent(AgentKind),
    Caller,
}

/// Structured summary returned to the requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub status: AggregateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<AgentKind>,
    pub succeeded: usize,
    pub failed: usize,
    pub entries: Vec<AggregatedEntry>,
}

impl AggregatedResult {
    pub fn recipient(&self) -> Recipient {
        match &self.return_to {
            Some(kind) => Recipient::Agent(kind.clone()),
            None => Recipient::Caller,
        }
    }

    pub fn entry(&self, task_id: &str) -> Option<&AggregatedEntry> {
        self.entries.iter().find(|e| e.task_id == task_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == AggregateStatus::Success
    }

    /// Stable JSON form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short plain-text digest, one line per task
    pub fn render_summary(&self) -> String {
        let mut out = format!(
            "delegation {:?}: {}/{} succeeded",
            self.status,
            self.succeeded,
            self.entries.len()
        );
        for entry in &self.entries {
            let _ = match (&entry.output, &entry.error) {
                (_, Some(err)) => write!(out, "\n- {} ({}): failed: {}", entry.task_id, entry.agent, err),
                (Some(Value::String(text)), None) => {
                    write!(out, "\n- {} ({}): {}", entry.task_id, entry.agent, text)
                }
                (Some(value), None) => write!(out, "\n- {} ({}): {}", entry.task_id, entry.agent, value),
                (None, None) => write!(out, "\n- {} ({}): ok", entry.task_id, entry.agent),
            };
        }
        out
    }
}

/// Combine outcomes (indexed by declaration order) into a result
///
/// Tasks still pending are reported as cancelled; callers aggregate only once
/// every task is terminal.
pub fn aggregate(graph: &Graph, outcomes: &[TaskOutcome]) -> AggregatedResult {
    let entries: Vec<AggregatedEntry> = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let (status, output, error) = match outcomes.get(i) {
                Some(TaskOutcome::Succeeded(value)) => {
                    (EntryStatus::Succeeded, Some(value.clone()), None)
                }
                Some(TaskOutcome::Failed(failure)) => {
                    (EntryStatus::Failed, None, Some(failure.clone()))
                }
                Some(TaskOutcome::Pending) | None => {
                    (EntryStatus::Failed, None, Some(TaskFailure::Cancelled))
                }
            };
            AggregatedEntry {
                task_id: node.spec.id.clone(),
                agent: node.spec.agent.clone(),
                status,
                output,
                error,
            }
        })
        .collect();

    let succeeded = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Succeeded)
        .count();
    let failed = entries.len() - succeeded;

    let status = if failed == 0 {
        AggregateStatus::Success
    } else if succeeded == 0 {
        AggregateStatus::Failure
    } else {
        AggregateStatus::PartialFailure
    };

    AggregatedResult {
        status,
        return_to: graph.return_to().cloned(),
        succeeded,
        failed,
        entries,
    }
}
