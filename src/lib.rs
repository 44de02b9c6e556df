//! # Conclave
//!
//! Delegation hub for specialised worker agents - the council that decides who
//! does what.
//!
//! A worker that needs help from other agents files a [`DelegationRequest`].
//! The [`Hub`] compiles it into a wave-partitioned task graph, runs the waves
//! in order with controlled parallelism, and hands an [`AggregatedResult`]
//! back to whoever the request names.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  DelegationRequest  ┌───────────────────────────────────────┐
//! │  worker    │ ──────────────────▶ │                 HUB                   │
//! │ (any kind) │                     │  ┌─────────┐  ┌────────────────────┐  │
//! └────────────┘                     │  │ compile │─▶│  wave scheduler    │  │
//!       ▲                            │  └─────────┘  └─────────┬──────────┘  │
//!       │                            └─────────────────────────┼─────────────┘
//!       │                                ┌─────────────────────┼──────────────┐
//!       │                                ▼                     ▼              ▼
//!       │                         ┌────────────┐        ┌────────────┐ ┌────────────┐
//!       │                wave 0   │  database  │        │            │ │            │
//!       │                         └─────┬──────┘        │            │ │            │
//!       │                wave 1         └──────────────▶│  backend   │ │  frontend  │
//!       │                                               └─────┬──────┘ └─────┬──────┘
//!       │                                                     └───────┬──────┘
//!       └──────────────────── AggregatedResult ◀──── aggregate ◀──────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **AgentKind**: a capability role tasks are routed to
//! - **Wave**: tasks that are ready together and may run concurrently
//! - **AgentRecord**: durable per-kind memory, written by the hub (status) and
//!   the worker (notes)
//! - **Slot**: each kind runs at most one task at a time, across all requests

pub mod agent;
pub mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod execution;
pub mod graph;
pub mod orchestrator;
pub mod request;
pub mod store;
pub mod worker;

pub use agent::{AgentKind, AgentRecord, AgentStatus, CustomKind};
pub use aggregator::{
    aggregate, AggregateStatus, AggregatedEntry, AggregatedResult, EntryStatus, Recipient,
    TaskOutcome,
};
pub use channel::{HubChannel, HubEvent};
pub use config::HubConfig;
pub use error::{CompileError, ConfigError, HubError, StoreError, TaskFailure, WireError};
pub use execution::{ExecutionHandle, ExecutionId, ExecutionSnapshot, TaskSnapshot, TaskState};
pub use graph::{compile, CompileLimits, Graph};
pub use orchestrator::{Delegation, Hub};
pub use request::{DelegationMode, DelegationRequest, TaskSpec};
pub use store::{AgentStateStore, FileStore, MemoryStore};
pub use worker::{AgentMemory, DependencyOutput, Invocation, Worker, WorkerRegistry};
