//! C5: Executor — drives a [`crate::compiler::CompiledPlan`] to completion
//! with real wall-clock concurrency: resource locks, circuit breakers,
//! retries with backoff, rate limiting, and saga compensation on failure.

pub mod breaker;
pub mod locks;
pub mod retry;
pub mod trace;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::bucket::TokenBucket;
use crate::compiler::CompiledPlan;
use crate::config::ExecutorConfig;
use crate::error::ExecError;
use crate::ir::{NodeId, PlanIr, PlanNode, ResourceAccess, RetryPolicy};
use crate::registry::ToolRegistry;
use crate::value::{ResolvedParams, Value};

use breaker::BreakerRegistry;
use locks::ResourceLockTable;
use retry::backoff_delay;
use trace::{ExecutionMetrics, FailureRecord, TraceEvent, TraceEventKind};

pub use trace::ExecutionResult;

/// Per-resource locks, per-tool breakers, the tool registry, and config,
/// confined to one `Executor` instance so multiple executors stay isolated.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
    locks: Arc<ResourceLockTable>,
    breakers: Arc<BreakerRegistry>,
    jitter_rng: Arc<Mutex<StdRng>>,
}

/// Per-run state shared (via `Arc`) across the dispatcher and its spawned workers.
struct Context {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
    locks: Arc<ResourceLockTable>,
    breakers: Arc<BreakerRegistry>,
    jitter_rng: Arc<Mutex<StdRng>>,
    buckets: HashMap<String, Arc<TokenBucket>>,
    plan: Arc<PlanIr>,
    execution_start: Instant,
    seq: AtomicU64,
    traces: Mutex<Vec<TraceEvent>>,
    metrics: Mutex<ExecutionMetrics>,
    outputs: DashMap<NodeId, serde_json::Value>,
}

impl Executor {
    /// Build an executor around a (possibly shared) tool registry.
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(
            config.circuit_breaker_window,
            config.circuit_breaker_threshold,
        ));
        let jitter_rng = Arc::new(Mutex::new(StdRng::seed_from_u64(config.jitter_seed)));
        Executor {
            registry,
            config,
            locks: Arc::new(ResourceLockTable::new()),
            breakers,
            jitter_rng,
        }
    }

    /// Drive `compiled` to completion: dispatch nodes honoring the compiled
    /// schedule's start offsets, stop on first failure, compensate in
    /// reverse completion order, and return whatever outputs/failures resulted.
    pub async fn execute(&self, compiled: &CompiledPlan) -> ExecutionResult {
        let ctx = Arc::new(Context {
            registry: self.registry.clone(),
            config: self.config.clone(),
            locks: self.locks.clone(),
            breakers: self.breakers.clone(),
            jitter_rng: self.jitter_rng.clone(),
            buckets: compiled.buckets.clone(),
            plan: compiled.plan.clone(),
            execution_start: Instant::now(),
            seq: AtomicU64::new(0),
            traces: Mutex::new(Vec::new()),
            metrics: Mutex::new(ExecutionMetrics::default()),
            outputs: DashMap::new(),
        });

        let plan = ctx.plan.clone();
        let total = plan.nodes.len();

        let mut remaining: HashMap<NodeId, usize> = plan
            .nodes
            .keys()
            .map(|id| (id.clone(), plan.predecessors(id).len()))
            .collect();
        let mut submitted: HashSet<NodeId> = HashSet::new();
        let mut completed: HashSet<NodeId> = HashSet::new();
        let mut failed_nodes: HashSet<NodeId> = HashSet::new();
        let mut completion_order: Vec<NodeId> = Vec::new();
        let mut failures: IndexMap<NodeId, FailureRecord> = IndexMap::new();
        let mut failed = false;
        let mut in_flight: usize = 0;

        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, Result<serde_json::Value, ExecError>)>();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));

        while completed.len() + failed_nodes.len() < total {
            if failed {
                if in_flight == 0 {
                    break;
                }
                if let Some(outcome) = rx.recv().await {
                    in_flight -= 1;
                    apply_outcome(
                        outcome,
                        &plan,
                        &mut remaining,
                        &mut completed,
                        &mut failed_nodes,
                        &mut completion_order,
                        &mut failures,
                        &mut failed,
                        &ctx.metrics,
                    );
                }
                continue;
            }

            let mut ready: Vec<NodeId> = remaining
                .iter()
                .filter(|(id, &count)| count == 0 && !submitted.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();
            ready.sort_by(|a, b| {
                let sa = compiled.schedule.get(a).map(|s| s.start_ms).unwrap_or(0.0);
                let sb = compiled.schedule.get(b).map(|s| s.start_ms).unwrap_or(0.0);
                sa.partial_cmp(&sb).unwrap().then_with(|| a.cmp(b))
            });

            let Some(next) = ready.into_iter().next() else {
                if in_flight == 0 {
                    break;
                }
                if let Some(outcome) = rx.recv().await {
                    in_flight -= 1;
                    apply_outcome(
                        outcome,
                        &plan,
                        &mut remaining,
                        &mut completed,
                        &mut failed_nodes,
                        &mut completion_order,
                        &mut failures,
                        &mut failed,
                        &ctx.metrics,
                    );
                }
                continue;
            };

            let start_ms = compiled.schedule.get(&next).map(|s| s.start_ms).unwrap_or(0.0);
            let elapsed_ms = ctx.execution_start.elapsed().as_secs_f64() * 1000.0;
            if elapsed_ms < start_ms {
                let wait = Duration::from_secs_f64(((start_ms - elapsed_ms) / 1000.0).min(0.005));
                if in_flight > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        Some(outcome) = rx.recv() => {
                            in_flight -= 1;
                            apply_outcome(outcome, &plan, &mut remaining, &mut completed, &mut failed_nodes, &mut completion_order, &mut failures, &mut failed, &ctx.metrics);
                        }
                    }
                } else {
                    tokio::time::sleep(wait).await;
                }
                continue;
            }

            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    submitted.insert(next.clone());
                    in_flight += 1;
                    let task_ctx = ctx.clone();
                    let node_id = next.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = run_node(task_ctx, node_id).await;
                        let _ = tx.send(result);
                        drop(permit);
                    });
                }
                Err(_) => {
                    if let Some(outcome) = rx.recv().await {
                        in_flight -= 1;
                        apply_outcome(
                            outcome,
                            &plan,
                            &mut remaining,
                            &mut completed,
                            &mut failed_nodes,
                            &mut completion_order,
                            &mut failures,
                            &mut failed,
                            &ctx.metrics,
                        );
                    }
                }
            }
        }

        while in_flight > 0 {
            match rx.recv().await {
                Some(outcome) => {
                    in_flight -= 1;
                    apply_outcome(
                        outcome,
                        &plan,
                        &mut remaining,
                        &mut completed,
                        &mut failed_nodes,
                        &mut completion_order,
                        &mut failures,
                        &mut failed,
                        &ctx.metrics,
                    );
                }
                None => break,
            }
        }

        if failed {
            run_compensation(&ctx, &plan, &completion_order).await;
        }

        let outputs: IndexMap<NodeId, serde_json::Value> = ctx
            .outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let duration_ms = ctx.execution_start.elapsed().as_secs_f64() * 1000.0;
        let traces = ctx.traces.lock().expect("trace mutex poisoned").clone();
        let metrics = ctx.metrics.lock().expect("metrics mutex poisoned").clone();

        ExecutionResult {
            outputs,
            failures,
            duration_ms,
            traces,
            metrics,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_outcome(
    outcome: (NodeId, Result<serde_json::Value, ExecError>),
    plan: &PlanIr,
    remaining: &mut HashMap<NodeId, usize>,
    completed: &mut HashSet<NodeId>,
    failed_nodes: &mut HashSet<NodeId>,
    completion_order: &mut Vec<NodeId>,
    failures: &mut IndexMap<NodeId, FailureRecord>,
    failed: &mut bool,
    metrics: &Mutex<ExecutionMetrics>,
) {
    let (id, result) = outcome;
    metrics.lock().expect("metrics mutex poisoned").nodes_run += 1;
    match result {
        Ok(_) => {
            completion_order.push(id.clone());
            completed.insert(id.clone());
            for succ in plan.successors(&id) {
                if let Some(count) = remaining.get_mut(&succ) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        Err(err) => {
            failed_nodes.insert(id.clone());
            failures.insert(
                id,
                FailureRecord {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                },
            );
            *failed = true;
        }
    }
}

async fn run_compensation(ctx: &Arc<Context>, plan: &PlanIr, completion_order: &[NodeId]) {
    for id in completion_order.iter().rev() {
        let node = &plan.nodes[id];
        let Some(compensation) = &node.compensation else {
            continue;
        };
        let output = ctx
            .outputs
            .get(id)
            .map(|v| v.value().clone())
            .unwrap_or(serde_json::Value::Null);
        match compensation.compensate(&output).await {
            Ok(()) => {
                ctx.metrics.lock().expect("metrics mutex poisoned").nodes_compensated += 1;
                emit_trace(ctx, id, &node.tool, TraceEventKind::Compensated);
            }
            Err(message) => {
                emit_trace(ctx, id, &node.tool, TraceEventKind::CompensationFailed { message });
            }
        }
    }
}

fn emit_trace(ctx: &Context, node_id: &NodeId, tool: &str, kind: TraceEventKind) {
    let seq = ctx.seq.fetch_add(1, Ordering::SeqCst);
    let t_ms = ctx.execution_start.elapsed().as_secs_f64() * 1000.0;
    ctx.traces.lock().expect("trace mutex poisoned").push(TraceEvent {
        seq,
        t_ms,
        node_id: node_id.clone(),
        tool: tool.to_string(),
        kind,
    });
}

fn resolve_value(value: &Value, outputs: &DashMap<NodeId, serde_json::Value>) -> Result<serde_json::Value, NodeId> {
    match value {
        Value::Literal(j) => Ok(j.clone()),
        Value::Ref { ref_ } => {
            let out = outputs.get(&ref_.0).ok_or_else(|| ref_.0.clone())?;
            match &ref_.1 {
                None => Ok(out.value().clone()),
                Some(field) => Ok(out.value().get(field).cloned().unwrap_or(serde_json::Value::Null)),
            }
        }
        Value::Map(m) => {
            let mut out = serde_json::Map::new();
            for (k, v) in m {
                out.insert(k.clone(), resolve_value(v, outputs)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::List(l) => {
            let mut out = Vec::with_capacity(l.len());
            for v in l {
                out.push(resolve_value(v, outputs)?);
            }
            Ok(serde_json::Value::Array(out))
        }
    }
}

/// Unwrap a tool's raw return value, extracting `_accessed_resources` when present.
fn unwrap_outcome(value: serde_json::Value) -> (serde_json::Value, Option<Vec<ResourceAccess>>) {
    if let serde_json::Value::Object(ref map) = value {
        if map.contains_key("output") || map.contains_key("_accessed_resources") || map.contains_key("_metadata") {
            let output = map.get("output").cloned().unwrap_or(serde_json::Value::Null);
            let accessed = map
                .get("_accessed_resources")
                .and_then(|v| serde_json::from_value::<Vec<ResourceAccess>>(v.clone()).ok());
            return (output, accessed);
        }
    }
    (value, None)
}

/// `LockTimeout` and `RateLimitExceeded` are always retried (up to the
/// policy's attempt budget); `CircuitOpen` and `MissingDependency` never are;
/// a `ToolError` is retried only if the tool's own failure kind is in `retry_error_set`.
fn is_retryable(err: &ExecError, tool_failure_kind: &Option<String>, retry: &RetryPolicy) -> bool {
    match err {
        ExecError::LockTimeout { .. } => true,
        ExecError::RateLimitExceeded { .. } => true,
        ExecError::CircuitOpen { .. } => false,
        ExecError::MissingDependency { .. } => false,
        ExecError::ToolError { .. } => {
            let kind = tool_failure_kind.as_deref().unwrap_or("ToolError");
            retry.retries_on(kind)
        }
    }
}

async fn attempt_once(
    ctx: &Arc<Context>,
    node_id: &NodeId,
    node: &PlanNode,
    tool_name: &str,
    resolved: &ResolvedParams,
) -> Result<serde_json::Value, (ExecError, Option<String>)> {
    let lock_timeout = Duration::from_secs_f64(ctx.config.lock_timeout_s);
    let wait_start = Instant::now();
    let lock_result = ctx.locks.acquire(&node.resources, lock_timeout).await;
    ctx.metrics.lock().expect("metrics mutex poisoned").lock_wait_ms +=
        wait_start.elapsed().as_secs_f64() * 1000.0;
    let locks = lock_result.map_err(|resource| {
        (
            ExecError::LockTimeout {
                node: node_id.clone(),
                resource,
            },
            None,
        )
    })?;

    let now_ms = ctx.execution_start.elapsed().as_secs_f64() * 1000.0;
    for access in &node.resources {
        if let Some(bucket) = ctx.buckets.get(&access.resource) {
            if !bucket.consume_at(now_ms) {
                drop(locks);
                return Err((
                    ExecError::RateLimitExceeded {
                        node: node_id.clone(),
                        resource: access.resource.clone(),
                    },
                    None,
                ));
            }
        }
    }

    let tool = match ctx.registry.get(tool_name) {
        Some(t) => t,
        None => {
            drop(locks);
            return Err((
                ExecError::ToolError {
                    node: node_id.clone(),
                    tool: tool_name.to_string(),
                    kind: "UnregisteredTool".to_string(),
                    message: "tool not registered".to_string(),
                },
                Some("UnregisteredTool".to_string()),
            ));
        }
    };

    let timeout_ms = tool.metadata.extra.get("timeout_ms").and_then(|v| v.as_f64());
    let invoke_fut = tool.executor.invoke(resolved.clone());
    let outcome = match timeout_ms {
        Some(ms) if ms > 0.0 => match tokio::time::timeout(Duration::from_secs_f64(ms / 1000.0), invoke_fut).await {
            Ok(r) => r,
            Err(_) => Err(crate::ir::ToolFailure {
                kind: "Timeout".to_string(),
                message: format!("tool exceeded its {ms}ms timeout"),
            }),
        },
        _ => invoke_fut.await,
    };
    drop(locks);

    match outcome {
        Ok(tool_outcome) => {
            let (value, accessed) = unwrap_outcome(tool_outcome.value);
            if let Some(accessed) = accessed {
                ctx.registry.expand_from_trace(tool_name, accessed);
            }
            ctx.outputs.insert(node_id.clone(), value.clone());
            Ok(value)
        }
        Err(failure) => {
            let kind = failure.kind.clone();
            Err((
                ExecError::ToolError {
                    node: node_id.clone(),
                    tool: tool_name.to_string(),
                    kind: kind.clone(),
                    message: failure.message,
                },
                Some(kind),
            ))
        }
    }
}

async fn run_node(ctx: Arc<Context>, node_id: NodeId) -> (NodeId, Result<serde_json::Value, ExecError>) {
    let node = &ctx.plan.nodes[&node_id];
    let tool_name = node.tool.clone();

    let mut resolved: ResolvedParams = IndexMap::new();
    for (k, v) in &node.params {
        match resolve_value(v, &ctx.outputs) {
            Ok(val) => {
                resolved.insert(k.clone(), val);
            }
            Err(missing) => {
                let err = ExecError::MissingDependency {
                    node: node_id.clone(),
                    missing,
                };
                emit_trace(
                    &ctx,
                    &node_id,
                    &tool_name,
                    TraceEventKind::Error {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                );
                return (node_id, Err(err));
            }
        }
    }
    if let Some(key) = &node.idempotency_key {
        resolved
            .entry("__idempotency_key".to_string())
            .or_insert_with(|| serde_json::json!(key));
    }

    let breaker = ctx.breakers.get(&tool_name);
    let mut attempts = 0u32;
    let mut retried_once = false;

    loop {
        attempts += 1;
        if breaker.is_open() {
            let err = ExecError::CircuitOpen {
                node: node_id.clone(),
                tool: tool_name.clone(),
            };
            emit_trace(
                &ctx,
                &node_id,
                &tool_name,
                TraceEventKind::Error {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                },
            );
            return (node_id, Err(err));
        }

        match attempt_once(&ctx, &node_id, node, &tool_name, &resolved).await {
            Ok(value) => {
                breaker.record_success();
                emit_trace(&ctx, &node_id, &tool_name, TraceEventKind::Success);
                return (node_id, Ok(value));
            }
            Err((exec_err, tool_kind)) => {
                breaker.record_failure();
                let retryable = is_retryable(&exec_err, &tool_kind, &node.retry);

                if !retryable {
                    emit_trace(
                        &ctx,
                        &node_id,
                        &tool_name,
                        TraceEventKind::Error {
                            kind: exec_err.kind().to_string(),
                            message: exec_err.to_string(),
                        },
                    );
                    return (node_id, Err(exec_err));
                }

                if attempts < node.retry.max_retries {
                    if !retried_once {
                        retried_once = true;
                        ctx.metrics.lock().expect("metrics mutex poisoned").nodes_retried += 1;
                    }
                    emit_trace(
                        &ctx,
                        &node_id,
                        &tool_name,
                        TraceEventKind::Retrying { attempt: attempts + 1 },
                    );
                    let delay = {
                        let mut rng = ctx.jitter_rng.lock().expect("jitter rng mutex poisoned");
                        backoff_delay(
                            attempts,
                            ctx.config.backoff_base_s,
                            ctx.config.max_backoff_s,
                            node.retry.backoff_gamma,
                            ctx.config.jitter,
                            &mut rng,
                        )
                    };
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if let Some(fallback) = &node.retry.fallback {
                    let value = fallback.call(&exec_err).await;
                    ctx.outputs.insert(node_id.clone(), value.clone());
                    return (node_id, Ok(value));
                }

                emit_trace(
                    &ctx,
                    &node_id,
                    &tool_name,
                    TraceEventKind::Error {
                        kind: exec_err.kind().to_string(),
                        message: exec_err.to_string(),
                    },
                );
                return (node_id, Err(exec_err));
            }
        }
    }
}
