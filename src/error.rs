//! Error types for plan construction, compilation, and execution.

use crate::ir::NodeId;
use thiserror::Error;

/// Errors raised while constructing or checking a [`crate::ir::PlanIr`].
#[derive(Debug, Clone, Error)]
pub enum IrError {
    /// The union of data, resource, and sync edges contains a cycle.
    #[error("cycle detected through node '{0}'")]
    CycleDetected(NodeId),

    /// A data edge's upstream/downstream output types were rejected by the type checker.
    #[error("type mismatch on edge {from} -> {to}: {reason}")]
    TypeMismatch {
        /// Upstream node.
        from: NodeId,
        /// Downstream node.
        to: NodeId,
        /// Why the type checker rejected the pair.
        reason: String,
    },

    /// A node's declared effect does not dominate its tool's inferred effect.
    #[error("node '{node}' declares effect weaker than tool '{tool}' requires")]
    EffectUnderDeclared {
        /// The offending node.
        node: NodeId,
        /// The tool whose inferred effect was under-declared.
        tool: String,
    },

    /// A node's declared resources do not cover the tool's inferred resources.
    #[error("node '{node}' under-declares resources required by tool '{tool}'")]
    ResourceUnderDeclared {
        /// The offending node.
        node: NodeId,
        /// The tool whose inferred resources were under-declared.
        tool: String,
    },

    /// A non-PURE node has no idempotency key.
    #[error("node '{0}' has a non-PURE effect but no idempotency_key")]
    MissingIdempotencyKey(NodeId),

    /// A `ref` parameter points at a node that does not exist in the plan.
    #[error("node '{from}' references unknown node '{to}'")]
    UnknownReference {
        /// The referencing node.
        from: NodeId,
        /// The referenced (missing) node.
        to: NodeId,
    },

    /// A node references a tool that was never registered.
    #[error("node '{node}' references unregistered tool '{tool}'")]
    UnknownTool {
        /// The offending node.
        node: NodeId,
        /// The missing tool name.
        tool: String,
    },

    /// A node id appears more than once in the input node list.
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(NodeId),
}

/// Errors raised while compiling a [`crate::ir::PlanIr`] into a [`crate::compiler::CompiledPlan`].
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The IR itself failed semantic consistency checking.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// No feasible start time could be found for some node before the deadline.
    #[error("no feasible schedule before deadline_ms={deadline_ms}: node '{node}' unplaceable")]
    ScheduleInfeasible {
        /// The configured deadline.
        deadline_ms: f64,
        /// The node that could not be placed.
        node: NodeId,
    },
}

/// Errors raised during execution of a [`crate::compiler::CompiledPlan`].
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// A resource lock could not be acquired within `lock_timeout_s`.
    #[error("timed out acquiring lock on resource '{resource}' for node '{node}'")]
    LockTimeout {
        /// The node attempting to acquire the lock.
        node: NodeId,
        /// The contended resource.
        resource: String,
    },

    /// A rate-limited resource had no token available at call time.
    #[error("rate limit exceeded on resource '{resource}' for node '{node}'")]
    RateLimitExceeded {
        /// The node attempting the call.
        node: NodeId,
        /// The exhausted resource.
        resource: String,
    },

    /// The tool's circuit breaker is open.
    #[error("circuit open for tool '{tool}' (node '{node}')")]
    CircuitOpen {
        /// The node attempting the call.
        node: NodeId,
        /// The tool whose breaker is open.
        tool: String,
    },

    /// The underlying tool invocation returned an error.
    #[error("tool '{tool}' failed for node '{node}': {message}")]
    ToolError {
        /// The node that failed.
        node: NodeId,
        /// The tool that raised.
        tool: String,
        /// The tool's own failure classification, matched against `RetryPolicy::retry_error_set`.
        kind: String,
        /// The error message from the tool.
        message: String,
    },

    /// A `ref` parameter resolved to an output that is not present.
    #[error("node '{node}' depends on missing output from node '{missing}'")]
    MissingDependency {
        /// The node whose params could not be resolved.
        node: NodeId,
        /// The upstream node whose output was absent.
        missing: NodeId,
    },
}

impl ExecError {
    /// The node this error concerns, for bookkeeping in the executor's failure map.
    pub fn node(&self) -> &NodeId {
        match self {
            ExecError::LockTimeout { node, .. }
            | ExecError::RateLimitExceeded { node, .. }
            | ExecError::CircuitOpen { node, .. }
            | ExecError::ToolError { node, .. }
            | ExecError::MissingDependency { node, .. } => node,
        }
    }

    /// A short, stable tag matching the error kind names in the design document.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::LockTimeout { .. } => "LockTimeout",
            ExecError::RateLimitExceeded { .. } => "RateLimitExceeded",
            ExecError::CircuitOpen { .. } => "CircuitOpen",
            ExecError::ToolError { .. } => "ToolError",
            ExecError::MissingDependency { .. } => "MissingDependency",
        }
    }
}

/// Result alias for IR construction and checking.
pub type IrResult<T> = std::result::Result<T, IrError>;
/// Result alias for compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;
/// Result alias for execution of a single node attempt.
pub type ExecResult<T> = std::result::Result<T, ExecError>;
