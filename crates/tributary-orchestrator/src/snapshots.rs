//! Step snapshots
//!
//! Steps may persist snapshots per flow execution. Once an execution has fully
//! progressed its snapshots are purged.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tributary_core::{FlowExecId, StepId};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Interface for the snapshot store
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    /// Delete every snapshot of a flow execution; returns the number removed
    async fn delete_snapshots(&self, flow_exec_id: &FlowExecId) -> OrchestratorResult<usize>;
}

/// In-memory implementation of SnapshotStore
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<FlowExecId, HashMap<StepId, Value>>>>,
    purges: Arc<RwLock<Vec<FlowExecId>>>,
    failing_purges: Arc<AtomicUsize>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save(&self, flow_exec_id: &FlowExecId, step_id: &StepId, snapshot: Value) {
        self.snapshots
            .write()
            .await
            .entry(flow_exec_id.clone())
            .or_default()
            .insert(step_id.clone(), snapshot);
    }

    pub async fn count(&self, flow_exec_id: &FlowExecId) -> usize {
        self.snapshots
            .read()
            .await
            .get(flow_exec_id)
            .map_or(0, HashMap::len)
    }

    /// Fail the next `count` purges
    pub fn fail_next_purges(&self, count: usize) {
        self.failing_purges.store(count, Ordering::SeqCst);
    }

    /// Every purge request, in call order
    pub async fn purges(&self) -> Vec<FlowExecId> {
        self.purges.read().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn delete_snapshots(&self, flow_exec_id: &FlowExecId) -> OrchestratorResult<usize> {
        self.purges.write().await.push(flow_exec_id.clone());
        if self
            .failing_purges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OrchestratorError::InternalError("Snapshot store unavailable".to_string()));
        }
        Ok(self
            .snapshots
            .write()
            .await
            .remove(flow_exec_id)
            .map_or(0, |steps| steps.len()))
    }
}
