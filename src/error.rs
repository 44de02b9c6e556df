//! Conclave error types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentKind;

/// Reasons a delegation request is rejected before anything runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// Request carries no tasks
    #[error("Delegation request has no tasks")]
    EmptyRequest,

    /// Single-mode request with anything other than one task
    #[error("Single-mode request must carry exactly one task, got {0}")]
    SingleModeArity(usize),

    /// Two tasks share an id
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// Custom agent kind that is not registered
    #[error("Unknown agent kind: {0}")]
    UnknownAgent(String),

    /// `depends_on` names a task that is not part of the request
    #[error("Task '{task}' depends on unknown task '{missing}'")]
    InvalidReference { task: String, missing: String },

    /// The dependency relation contains a cycle
    #[error("Cyclic dependency between tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    /// Delegating would go deeper than the hub allows
    #[error("Nesting exceeded: delegation depth {depth} is beyond the maximum of {max}")]
    NestingExceeded { depth: u32, max: u32 },

    /// A task targets a kind whose invocation is waiting on this very request
    #[error("Task '{task}' delegates back to agent '{agent}', which is waiting on this request")]
    ReentrantDelegation { task: String, agent: AgentKind },
}

/// Why a single task ended in `Failed`
///
/// Recorded per task; never aborts the surrounding execution.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The worker returned an error
    #[error("Worker error: {0}")]
    WorkerError(String),

    /// The task ran past its deadline
    #[error("Task timed out")]
    Timeout,

    /// The execution was cancelled before the task finished
    #[error("Task cancelled")]
    Cancelled,

    /// A dependency failed, so the task never ran
    #[error("Upstream dependency failed")]
    UpstreamFailure,
}

/// Agent state store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be (de)serialized
    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Kind name cannot key a record
    #[error("Invalid agent kind name for a record: {0:?}")]
    InvalidKind(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for `HubConfig`
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but holds an unusable value
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Malformed delegation payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Required field absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A `parallel_groups` entry names an unknown task
    #[error("Parallel group references unknown task: {0}")]
    UnknownGroupMember(String),

    /// A task was placed in two different groups
    #[error("Task '{0}' appears in more than one parallel group")]
    ConflictingGroup(String),

    /// A request with an `agents` list names no known mode in `type`
    #[error("Unknown delegation type: {0}")]
    UnknownType(String),
}

/// Top-level hub errors
#[derive(Debug, Error)]
pub enum HubError {
    /// Request rejected at compile time
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire format error
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Payload is not JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_tasks() {
        let err = CompileError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Cyclic dependency between tasks: a, b");
    }

    #[test]
    fn test_task_failure_serializes_tagged() {
        let json = serde_json::to_string(&TaskFailure::WorkerError("boom".into())).unwrap();
        assert_eq!(json, r#"{"reason":"worker_error","message":"boom"}"#);

        let json = serde_json::to_string(&TaskFailure::Timeout).unwrap();
        assert_eq!(json, r#"{"reason":"timeout"}"#);
    }

    #[test]
    fn test_hub_error_from_compile_error() {
        let err: HubError = CompileError::EmptyRequest.into();
        assert!(matches!(err, HubError::Compile(CompileError::EmptyRequest)));
    }
}
