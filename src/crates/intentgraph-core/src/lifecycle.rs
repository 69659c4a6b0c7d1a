//! NodeLifecycle — readiness computation and failure-cascade propagation.
//!
//! Join semantics are conjunctive: a node becomes READY only when every incoming
//! edge is satisfied. A FAILED or SKIPPED predecessor on any incoming edge cascades
//! SKIPPED to the node; an unsatisfied conditional edge from a COMPLETE predecessor
//! leaves the node PENDING indefinitely rather than failing or skipping it.

use crate::condition::EdgeEvaluator;
use crate::graph::GraphDocument;
use crate::state::{ExecutionState, NodeStatus};

enum EdgeOutcome {
    Pass,
    Blocked,
    Waiting,
    Cascade,
}

pub struct NodeLifecycle;

impl NodeLifecycle {
    /// Re-derive readiness for every PENDING node, skipping any whose incoming edges
    /// show a failed or skipped predecessor. Returns the ids newly marked READY and
    /// the ids newly marked SKIPPED, so the caller can wake workers / recurse.
    ///
    /// Run to a fixpoint: a single pass only sees cascades one hop deep, so the
    /// scheduler calls this repeatedly until it reports no further changes.
    pub fn advance(graph: &GraphDocument, state: &ExecutionState) -> (Vec<String>, Vec<String>) {
        let mut newly_ready = Vec::new();
        let mut newly_skipped = Vec::new();

        for node_id in graph.node_ids() {
            if state.status(node_id) != Some(NodeStatus::Pending) {
                continue;
            }

            let incoming: Vec<_> = graph.incoming_edges(node_id).collect();
            if incoming.is_empty() {
                state.mark_ready(node_id);
                newly_ready.push(node_id.clone());
                continue;
            }

            let mut any_cascade = false;
            let mut any_blocked = false;
            let mut any_waiting = false;

            for edge in &incoming {
                match Self::edge_outcome(edge, state) {
                    EdgeOutcome::Cascade => any_cascade = true,
                    EdgeOutcome::Blocked => any_blocked = true,
                    EdgeOutcome::Waiting => any_waiting = true,
                    EdgeOutcome::Pass => {}
                }
            }

            if any_cascade {
                state.mark_skipped(node_id);
                newly_skipped.push(node_id.clone());
            } else if !any_blocked && !any_waiting {
                state.mark_ready(node_id);
                newly_ready.push(node_id.clone());
            }
            // else: leave PENDING — either a blocked conditional edge (stays pending
            // forever) or an upstream node still in flight (revisit next pass).
        }

        (newly_ready, newly_skipped)
    }

    fn edge_outcome(edge: &crate::graph::EdgeSpec, state: &ExecutionState) -> EdgeOutcome {
        match state.status(&edge.from) {
            Some(NodeStatus::Complete) => {
                let output = state.output(&edge.from).unwrap_or(serde_json::Value::Null);
                if EdgeEvaluator::is_satisfied(edge, &output) {
                    EdgeOutcome::Pass
                } else {
                    EdgeOutcome::Blocked
                }
            }
            Some(NodeStatus::Failed) | Some(NodeStatus::Skipped) => EdgeOutcome::Cascade,
            _ => EdgeOutcome::Waiting,
        }
    }

    /// Run [`Self::advance`] to a fixpoint, returning the union of all ids marked
    /// ready or skipped across every pass.
    pub fn advance_to_fixpoint(graph: &GraphDocument, state: &ExecutionState) -> (Vec<String>, Vec<String>) {
        let mut all_ready = Vec::new();
        let mut all_skipped = Vec::new();
        loop {
            let (ready, skipped) = Self::advance(graph, state);
            if ready.is_empty() && skipped.is_empty() {
                break;
            }
            all_ready.extend(ready);
            all_skipped.extend(skipped);
        }
        (all_ready, all_skipped)
    }
}
