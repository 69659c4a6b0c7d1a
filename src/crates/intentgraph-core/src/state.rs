//! ExecutionState — in-memory per-execution store of node statuses, outputs, and
//! errors.
//!
//! Exactly one writer touches the tables at a time: the scheduler and its workers,
//! serialized by `ExecutionState`'s internal lock (I3, I5 from the data model).
//! Completion is observed by the scheduler through each worker's `JoinHandle`
//! directly (see `scheduler::run_loop`), not through a side-channel signal here —
//! a shared `Notify` would require the waiter to register before the notifying
//! write happens, which a spawned worker racing the control loop can't guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::graph::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct NodeTimestamps {
    pub ready_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NodeRuntime {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<Arc<GraphError>>,
    pub attempt: u32,
    pub timestamps: NodeTimestamps,
}

impl NodeRuntime {
    fn new() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            attempt: 0,
            timestamps: NodeTimestamps::default(),
        }
    }

    /// I4: a node's output is readable iff its status is COMPLETE.
    pub fn readable_output(&self) -> Option<&Value> {
        if self.status == NodeStatus::Complete {
            self.output.as_ref()
        } else {
            None
        }
    }
}

/// Terminal counts, keyed by the node statuses a run can end in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
}

/// The sole owner of all [`NodeRuntime`] instances for one execution.
pub struct ExecutionState {
    nodes: Mutex<HashMap<NodeId, NodeRuntime>>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes = node_ids
            .into_iter()
            .map(|id| (id, NodeRuntime::new()))
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            started_at: Utc::now(),
        }
    }

    pub fn status(&self, node: &str) -> Option<NodeStatus> {
        self.nodes.lock().get(node).map(|r| r.status)
    }

    pub fn output(&self, node: &str) -> Option<Value> {
        self.nodes.lock().get(node).and_then(|r| r.readable_output().cloned())
    }

    pub fn running_count(&self) -> usize {
        self.nodes
            .lock()
            .values()
            .filter(|r| r.status == NodeStatus::Running)
            .count()
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn attempt(&self, node: &str) -> u32 {
        self.nodes.lock().get(node).map(|r| r.attempt).unwrap_or(0)
    }

    /// PENDING -> READY
    pub fn mark_ready(&self, node: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(r) = nodes.get_mut(node) {
            debug_assert_eq!(r.status, NodeStatus::Pending);
            r.status = NodeStatus::Ready;
            r.timestamps.ready_at = Some(Utc::now());
        }
    }

    /// READY -> RUNNING
    pub fn mark_running(&self, node: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(r) = nodes.get_mut(node) {
            r.status = NodeStatus::Running;
            r.attempt += 1;
            r.timestamps.running_at = Some(Utc::now());
        }
    }

    /// RUNNING -> COMPLETE. Publishes the output.
    pub fn mark_complete(&self, node: &str, output: Value) {
        let mut nodes = self.nodes.lock();
        if let Some(r) = nodes.get_mut(node) {
            r.status = NodeStatus::Complete;
            r.output = Some(output);
            r.timestamps.finished_at = Some(Utc::now());
        }
    }

    /// RUNNING -> FAILED, or FAILED -> READY if a retry will be attempted (the retry
    /// transition is driven by the dispatcher re-invoking `mark_running`, not here).
    pub fn mark_failed(&self, node: &str, error: GraphError) {
        let mut nodes = self.nodes.lock();
        if let Some(r) = nodes.get_mut(node) {
            r.status = NodeStatus::Failed;
            r.error = Some(Arc::new(error));
            r.timestamps.finished_at = Some(Utc::now());
        }
    }

    /// PENDING/READY -> SKIPPED, cascaded by NodeLifecycle.
    pub fn mark_skipped(&self, node: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(r) = nodes.get_mut(node) {
            if r.status == NodeStatus::Pending || r.status == NodeStatus::Ready {
                r.status = NodeStatus::Skipped;
                r.timestamps.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn error_of(&self, node: &str) -> Option<Arc<GraphError>> {
        self.nodes.lock().get(node).and_then(|r| r.error.clone())
    }

    pub fn summary(&self) -> StatusSummary {
        let nodes = self.nodes.lock();
        let mut summary = StatusSummary::default();
        for r in nodes.values() {
            match r.status {
                NodeStatus::Complete => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Pending | NodeStatus::Ready => summary.pending += 1,
                NodeStatus::Running => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_transitions_and_output_visibility() {
        let state = ExecutionState::new(["A".to_string()]);
        assert_eq!(state.status("A"), Some(NodeStatus::Pending));
        assert!(state.output("A").is_none());

        state.mark_ready("A");
        assert_eq!(state.status("A"), Some(NodeStatus::Ready));

        state.mark_running("A");
        assert_eq!(state.status("A"), Some(NodeStatus::Running));
        assert_eq!(state.running_count(), 1);

        state.mark_complete("A", json!({"ok": true}));
        assert_eq!(state.status("A"), Some(NodeStatus::Complete));
        assert_eq!(state.output("A"), Some(json!({"ok": true})));
        assert_eq!(state.running_count(), 0);
    }

    #[test]
    fn failed_output_is_not_readable() {
        let state = ExecutionState::new(["A".to_string()]);
        state.mark_ready("A");
        state.mark_running("A");
        state.mark_failed("A", GraphError::Internal("x".into()));
        assert!(state.output("A").is_none());
        assert_eq!(state.status("A"), Some(NodeStatus::Failed));
    }

    #[test]
    fn summary_counts_pending_separately_from_skipped() {
        let state = ExecutionState::new(["A".to_string(), "B".to_string(), "C".to_string()]);
        state.mark_ready("A");
        state.mark_running("A");
        state.mark_complete("A", json!({}));
        state.mark_skipped("B");
        let summary = state.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, 1);
    }
}
