//! The Plan IR data model: nodes, edges, effects, resources, and retry policy.
//!
//! See `checker` for construction and semantic consistency checking, and
//! `registry` for the tool catalog this module's inference rules consult.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::value::Value;

/// A plan node identifier. Cheap to clone; compares and hashes as its string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Side-effect strength, ordered PURE < READ < WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffect {
    /// No observable effect; may be re-run or reordered freely.
    Pure,
    /// Observes external state without mutating it.
    Read,
    /// Mutates external state.
    Write,
}

/// Effect locality, ordered LOCAL < EXTERNAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Confined to the local process/host.
    Local,
    /// Crosses a process or network boundary.
    External,
}

/// An (effect strength, locality) pair with a dominance partial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectType {
    /// The side-effect component.
    pub side_effect: SideEffect,
    /// The environment component.
    pub environment: Environment,
}

impl EffectType {
    /// The strongest possible effect: `(WRITE, EXTERNAL)`.
    pub const CONSERVATIVE: EffectType = EffectType {
        side_effect: SideEffect::Write,
        environment: Environment::External,
    };

    /// The weakest possible effect: `(PURE, LOCAL)`.
    pub const PURE_LOCAL: EffectType = EffectType {
        side_effect: SideEffect::Pure,
        environment: Environment::Local,
    };

    /// `self` dominates `other` iff both components of `self` rank `>=` those of `other`.
    pub fn dominates(&self, other: &EffectType) -> bool {
        self.side_effect >= other.side_effect && self.environment >= other.environment
    }

    /// The componentwise join (strongest of each component) of two effects.
    pub fn join(&self, other: &EffectType) -> EffectType {
        EffectType {
            side_effect: self.side_effect.max(other.side_effect),
            environment: self.environment.max(other.environment),
        }
    }
}

/// Read/write access mode for a [`ResourceAccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    /// Shared read access.
    R,
    /// Exclusive write access.
    W,
}

/// A single access to a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAccess {
    /// The resource name (e.g. a file path, an API quota bucket, a table name).
    pub resource: String,
    /// Whether this access reads or writes the resource.
    pub mode: AccessMode,
}

impl ResourceAccess {
    /// Two accesses conflict iff they name the same resource and at least one writes.
    pub fn conflicts_with(&self, other: &ResourceAccess) -> bool {
        self.resource == other.resource
            && (self.mode == AccessMode::W || other.mode == AccessMode::W)
    }
}

/// Retry behavior attached to a plan node.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first.
    pub max_retries: u32,
    /// Exponential backoff multiplier; must be `>= 1.0`.
    pub backoff_gamma: f64,
    /// Error kinds eligible for retry. Empty means "retry any kind".
    pub retry_error_set: HashSet<String>,
    /// Invoked with the terminal error once retries are exhausted, in place of re-raising.
    pub fallback: Option<Arc<dyn Fallback>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff_gamma", &self.backoff_gamma)
            .field("retry_error_set", &self.retry_error_set)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            backoff_gamma: 1.0,
            retry_error_set: HashSet::new(),
            fallback: None,
        }
    }
}

impl RetryPolicy {
    /// Whether `error_kind` is eligible for retry under this policy.
    pub fn retries_on(&self, error_kind: &str) -> bool {
        self.retry_error_set.is_empty() || self.retry_error_set.contains(error_kind)
    }
}

/// A terminal-error fallback invoked once a node's retries are exhausted.
#[async_trait]
pub trait Fallback: Send + Sync {
    /// Produce a substitute output for the given terminal error.
    async fn call(&self, error: &ExecError) -> serde_json::Value;
}

/// A node-level compensating action invoked during saga rollback. A
/// compensation failure is logged into the trace; it never re-raises or
/// blocks subsequent compensations.
#[async_trait]
pub trait Compensation: Send + Sync {
    /// Undo the effect of a node given its recorded output.
    async fn compensate(&self, output: &serde_json::Value) -> Result<(), String>;
}

/// The outcome of one tool invocation attempt, before the executor unwraps the
/// reserved `output` / `_accessed_resources` / `_metadata` keys.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// The raw value the tool returned.
    pub value: serde_json::Value,
}

/// A classified failure raised by a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    /// A short machine-matchable kind, checked against `RetryPolicy::retry_error_set`.
    pub kind: String,
    /// A human-readable message.
    pub message: String,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The invocable behind a [`Tool`] descriptor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Invoke the tool with its resolved keyword parameters.
    async fn invoke(
        &self,
        params: crate::value::ResolvedParams,
    ) -> Result<ToolOutcome, ToolFailure>;
}

/// Free-form tool metadata consulted by penalty scoring and effect inference.
#[derive(Debug, Clone, Default)]
pub struct ToolMetadata {
    /// Probability that an invocation of this tool fails, used in retry_penalty scoring.
    pub failure_prob: f64,
    /// Arbitrary extra metadata the planner or tool author wants to carry along.
    pub extra: IndexMap<String, serde_json::Value>,
}

/// A registered tool: an invocable plus its effect/resource/latency descriptor.
pub struct Tool {
    /// The tool's registry name.
    pub name: String,
    /// The invocable implementation.
    pub executor: Arc<dyn ToolExecutor>,
    /// The tool's own inferred effect. `None` means unspecified (forces the
    /// registry's conservative default).
    pub effect: Option<EffectType>,
    /// The resources this tool is known to access.
    pub resources: Vec<ResourceAccess>,
    /// Expected wall-clock latency in milliseconds, used for scheduling.
    pub expected_latency_ms: f64,
    /// Expected monetary/quota cost, informational only.
    pub expected_cost: f64,
    /// Free-form metadata.
    pub metadata: ToolMetadata,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("effect", &self.effect)
            .field("resources", &self.resources)
            .field("expected_latency_ms", &self.expected_latency_ms)
            .field("expected_cost", &self.expected_cost)
            .finish()
    }
}

/// Lifecycle status of a [`Skill`] — a `Tool` promoted through a rollout gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillStatus {
    /// Registered but not yet exposed to real traffic.
    Shadow,
    /// Exposed to a small fraction of traffic.
    Canary,
    /// Fully promoted.
    Stable,
    /// No longer recommended; retained for in-flight plans only.
    Deprecated,
}

/// A [`Tool`] augmented with a lifecycle status and description. The core
/// treats a `Skill` identically to a `Tool` once registered.
pub struct Skill {
    /// The underlying tool descriptor.
    pub tool: Tool,
    /// The skill's rollout status.
    pub status: SkillStatus,
    /// Human-readable description surfaced to planners.
    pub description: String,
}

/// A single node in the plan graph.
pub struct PlanNode {
    /// This node's unique identifier within the plan.
    pub id: NodeId,
    /// The name of the tool to invoke, looked up in the [`crate::registry::ToolRegistry`].
    pub tool: String,
    /// Keyword parameters, which may reference upstream outputs.
    pub params: IndexMap<String, Value>,
    /// The declared effect, which must dominate the tool's inferred effect.
    pub effect: EffectType,
    /// The declared resources, which must be a superset of the tool's inferred resources.
    pub resources: Vec<ResourceAccess>,
    /// Retry behavior for this node.
    pub retry: RetryPolicy,
    /// Required for any non-PURE node; lets a tool deduplicate retried invocations.
    pub idempotency_key: Option<String>,
    /// The declared output type tag, consulted by the type checker on outgoing data edges.
    pub output_type: Option<String>,
    /// An optional saga-style compensation, invoked on rollback if this node succeeded.
    pub compensation: Option<Arc<dyn Compensation>>,
}

impl fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanNode")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .field("effect", &self.effect)
            .field("resources", &self.resources)
            .field("idempotency_key", &self.idempotency_key)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// An immutable directed acyclic graph of [`PlanNode`]s plus their three edge kinds.
#[derive(Debug)]
pub struct PlanIr {
    /// Nodes indexed by id, in the deterministic topological order computed at construction.
    pub nodes: IndexMap<NodeId, PlanNode>,
    /// Edges induced by `ref` parameters.
    pub data_edges: Vec<(NodeId, NodeId)>,
    /// Edges induced by conflicting resource accesses.
    pub resource_edges: Vec<(NodeId, NodeId)>,
    /// Edges added by the compiler to totally order writers. Empty at construction.
    pub sync_edges: Vec<(NodeId, NodeId)>,
}

impl PlanIr {
    /// Iterate all edges across the three kinds.
    pub fn all_edges(&self) -> impl Iterator<Item = &(NodeId, NodeId)> {
        self.data_edges
            .iter()
            .chain(self.resource_edges.iter())
            .chain(self.sync_edges.iter())
    }

    /// The predecessors of `node` across all edge kinds.
    pub fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        self.all_edges()
            .filter(|(_, v)| v == node)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// The successors of `node` across all edge kinds.
    pub fn successors(&self, node: &NodeId) -> Vec<NodeId> {
        self.all_edges()
            .filter(|(u, _)| u == node)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// The tool's expected latency for `node`, looked up from `tool`'s entry in `self.nodes`.
    pub fn latency_ms(&self, registry: &crate::registry::ToolRegistry, node: &NodeId) -> f64 {
        let n = &self.nodes[node];
        registry
            .get(&n.tool)
            .map(|t| t.expected_latency_ms)
            .unwrap_or(0.0)
    }
}
