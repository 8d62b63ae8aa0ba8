//!
//! Tributary Core - domain model and store contracts for the Tributary orchestrator
//!
//! This crate defines the flow topology model, the execution journal and
//! progress counter records, the repository traits every store implements,
//! and the two store-level services built on them. It is the foundation for
//! the in-memory stores and the orchestrator service.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - entities, records and repository contracts
pub mod domain;

/// Application services - journal and progress counters
pub mod application;

/// Error types
pub mod error;

pub use error::CoreError;

// Re-export main API types for easy use
pub use application::journal::ExecutionJournal;
pub use application::progress::{ProgressCounterStore, RetryPolicy};
pub use domain::component::{Component, SpecialFlags, Workload, WorkloadKind};
pub use domain::counters::{
    DuplicateMessageRecord, DuplicateMessageStats, FlowExecutionCounters, StepCounter,
};
pub use domain::execution::{
    ExecutionRecord, ExecutionStart, StateHistoryEntry, StepExecution, INITIAL_STATE,
};
pub use domain::flow::{Flow, FlowEdge, FlowGraph, FlowNode, FlowStatus};
pub use domain::ids::{ComponentId, ExecutionId, FlowExecId, FlowId, MessageId, StepId};
pub use domain::repository::{
    ComponentRegistry, ExecutionStateRepository, FlowRegistry, FlowStateRepository,
};
