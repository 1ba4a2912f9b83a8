//! The executor's result and trace types.

use indexmap::IndexMap;
use serde::Serialize;

use crate::ir::NodeId;

/// What happened to one node, recorded in completion order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEventKind {
    /// The node's tool returned successfully.
    Success,
    /// The node's retry loop is sleeping before another attempt.
    Retrying {
        /// The attempt number about to be made (1-indexed).
        attempt: u32,
    },
    /// The node failed terminally.
    Error {
        /// The error kind, matching [`crate::error::ExecError::kind`].
        kind: String,
        /// A human-readable message.
        message: String,
    },
    /// The node's compensation ran after a downstream failure.
    Compensated,
    /// The node's compensation itself raised; logged, not propagated.
    CompensationFailed {
        /// What the compensation failure said.
        message: String,
    },
}

/// A single trace entry, ordered by `seq`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Monotonic sequence number, assigned in emission order.
    pub seq: u64,
    /// Milliseconds since execution start.
    pub t_ms: f64,
    /// The node this event concerns.
    pub node_id: NodeId,
    /// The tool the node invokes.
    pub tool: String,
    /// What happened.
    pub kind: TraceEventKind,
}

/// A terminal failure recorded against a node.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    /// The error kind, matching [`crate::error::ExecError::kind`].
    pub kind: String,
    /// A human-readable message.
    pub message: String,
}

/// Aggregate counters over one execution run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    /// Nodes that reached a terminal state (Succeeded or Failed).
    pub nodes_run: usize,
    /// Nodes that entered Retrying at least once.
    pub nodes_retried: usize,
    /// Nodes whose compensation was invoked.
    pub nodes_compensated: usize,
    /// Cumulative time spent waiting on resource locks, across all nodes.
    pub lock_wait_ms: f64,
}

/// The result of driving a [`crate::compiler::CompiledPlan`] to completion.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Each succeeded node's unwrapped output.
    pub outputs: IndexMap<NodeId, serde_json::Value>,
    /// Each failed node's error kind and message.
    pub failures: IndexMap<NodeId, FailureRecord>,
    /// Wall-clock duration of the whole run.
    pub duration_ms: f64,
    /// Trace events in completion order.
    pub traces: Vec<TraceEvent>,
    /// Aggregate counters.
    pub metrics: ExecutionMetrics,
}
