/// Identifier value objects
pub mod ids;

/// Flow topology
pub mod flow;

/// Components and workloads
pub mod component;

/// Execution journal records
pub mod execution;

/// Progress counters and duplicate audit
pub mod counters;

/// Repository interfaces
pub mod repository;
