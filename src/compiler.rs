//! C4: Semantic Compiler — turns a checked [`PlanIr`] into a [`CompiledPlan`]
//! via sync-edge derivation, EST/LST analysis, HEFT-style list scheduling,
//! and advisory penalty scoring.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bucket::TokenBucket;
use crate::checker::{check_semantic_consistency, topological_order, IdentityTypeChecker};
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::ir::{AccessMode, NodeId, PlanIr, ResourceAccess};
use crate::registry::ToolRegistry;

/// A node's assigned start/end time in the compiled schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Scheduled start time, in milliseconds relative to execution start.
    pub start_ms: f64,
    /// Scheduled end time; `start_ms + latency_ms`.
    pub end_ms: f64,
}

/// The output of [`compile`]: a checked IR plus its schedule and advisory scores.
#[derive(Debug)]
pub struct CompiledPlan {
    /// The IR this plan was compiled from, with sync_edges populated.
    pub plan: Arc<PlanIr>,
    /// Per-node assigned schedule.
    pub schedule: IndexMap<NodeId, Schedule>,
    /// The makespan of the compiled schedule.
    pub critical_path_ms: f64,
    /// Earliest start time per node, over the full edge union.
    pub est: IndexMap<NodeId, f64>,
    /// Latest start time per node without delaying the makespan.
    pub lst: IndexMap<NodeId, f64>,
    /// `lst - est` per node.
    pub slack: IndexMap<NodeId, f64>,
    /// Advisory: quadratic overage penalty for rate-limited resources.
    pub rate_penalty: f64,
    /// Advisory: expected retry cost, weighted by failure probability.
    pub retry_penalty: f64,
    /// Token buckets built from the compiler config, one per rate-limited
    /// resource. The executor reuses these same instances, since its
    /// wall-clock timeline (relative to execution start) is the same
    /// timeline the compiler reserved tokens against.
    pub buckets: HashMap<String, Arc<TokenBucket>>,
}

/// Compile a semantically-consistent IR into a schedule. Consumes `ir` and
/// returns it (with `sync_edges` populated) inside the resulting plan.
pub fn compile(ir: PlanIr, registry: &ToolRegistry, config: &CompilerConfig) -> CompileResult<CompiledPlan> {
    check_semantic_consistency(&ir, registry, &IdentityTypeChecker)?;

    let mut ir = ir;
    ir.sync_edges = phase_a_sync_edges(&ir);

    let ids: Vec<NodeId> = ir.nodes.keys().cloned().collect();
    let all_edges: Vec<(NodeId, NodeId)> = ir.all_edges().cloned().collect();
    let topo = topological_order(&ids, &all_edges)?;

    let (est, critical_path_ms, lst, slack) = phase_b_est_lst(&ir, registry, &topo);
    let rank = phase_c_rank(&ir, registry, &topo);

    let buckets: HashMap<String, Arc<TokenBucket>> = config
        .rate_limits
        .iter()
        .map(|(resource, rate_per_sec)| {
            let capacity = config.burst_for(resource).unwrap_or(*rate_per_sec);
            let bucket = TokenBucket::new(rate_per_sec / 1000.0, capacity);
            (resource.clone(), Arc::new(bucket))
        })
        .collect();

    let schedule = phase_c_schedule(&ir, registry, config, &rank, &buckets)?;
    let rate_penalty = phase_d_rate_penalty(&ir, config, &schedule);
    let retry_penalty = phase_d_retry_penalty(&ir, registry);

    Ok(CompiledPlan {
        plan: Arc::new(ir),
        schedule,
        critical_path_ms,
        est,
        lst,
        slack,
        rate_penalty,
        retry_penalty,
        buckets,
    })
}

/// Phase A: order each resource's writers by data-topological position and
/// add a sync_edge between consecutive writers.
fn phase_a_sync_edges(ir: &PlanIr) -> Vec<(NodeId, NodeId)> {
    let mut writers_by_resource: IndexMap<&str, Vec<NodeId>> = IndexMap::new();
    for (id, node) in &ir.nodes {
        for access in &node.resources {
            if access.mode == AccessMode::W {
                writers_by_resource
                    .entry(access.resource.as_str())
                    .or_insert_with(Vec::new)
                    .push(id.clone());
            }
        }
    }
    writers_by_resource
        .into_values()
        .flat_map(|writers| {
            writers
                .windows(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Phase B: EST, critical path, LST, and slack over the full edge union.
fn phase_b_est_lst(
    ir: &PlanIr,
    registry: &ToolRegistry,
    topo: &[NodeId],
) -> (
    IndexMap<NodeId, f64>,
    f64,
    IndexMap<NodeId, f64>,
    IndexMap<NodeId, f64>,
) {
    let mut est: IndexMap<NodeId, f64> = IndexMap::new();
    for id in topo {
        let e = ir
            .predecessors(id)
            .iter()
            .map(|p| est[p] + ir.latency_ms(registry, p))
            .fold(0.0_f64, f64::max);
        est.insert(id.clone(), e);
    }

    let critical_path_ms = topo
        .iter()
        .map(|id| est[id] + ir.latency_ms(registry, id))
        .fold(0.0_f64, f64::max);

    let mut lst: IndexMap<NodeId, f64> = IndexMap::new();
    for id in topo.iter().rev() {
        let latency = ir.latency_ms(registry, id);
        let succs = ir.successors(id);
        let l = if succs.is_empty() {
            critical_path_ms - latency
        } else {
            succs
                .iter()
                .map(|s| lst[s] - latency)
                .fold(f64::INFINITY, f64::min)
        };
        lst.insert(id.clone(), l);
    }

    let mut slack: IndexMap<NodeId, f64> = IndexMap::new();
    for id in topo {
        slack.insert(id.clone(), lst[id] - est[id]);
    }

    (est, critical_path_ms, lst, slack)
}

/// The HEFT-style upward rank: latency plus the maximum rank among successors.
fn phase_c_rank(ir: &PlanIr, registry: &ToolRegistry, topo: &[NodeId]) -> IndexMap<NodeId, f64> {
    let mut rank: IndexMap<NodeId, f64> = IndexMap::new();
    for id in topo.iter().rev() {
        let latency = ir.latency_ms(registry, id);
        let succs = ir.successors(id);
        let r = if succs.is_empty() {
            latency
        } else {
            latency
                + succs
                    .iter()
                    .map(|s| rank[s])
                    .fold(f64::NEG_INFINITY, f64::max)
        };
        rank.insert(id.clone(), r);
    }
    rank
}

const MAX_PROBES: usize = 10_000;

fn interval_overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> bool {
    a_start < b_end && b_start < a_end
}

fn is_feasible(
    t: f64,
    latency: f64,
    resources: &[ResourceAccess],
    concurrency_limit: usize,
    ir: &PlanIr,
    scheduled: &IndexMap<NodeId, Schedule>,
    buckets: &HashMap<String, Arc<TokenBucket>>,
    deadline_ms: f64,
) -> bool {
    let end = t + latency;
    if end > deadline_ms {
        return false;
    }
    let mut overlap_count = 0usize;
    for (id, s) in scheduled {
        if interval_overlap(t, end, s.start_ms, s.end_ms) {
            overlap_count += 1;
            let other = &ir.nodes[id];
            let conflicts = resources
                .iter()
                .any(|a| other.resources.iter().any(|b| a.conflicts_with(b)));
            if conflicts {
                return false;
            }
        }
    }
    if overlap_count >= concurrency_limit {
        return false;
    }
    for access in resources {
        if let Some(bucket) = buckets.get(&access.resource) {
            if !bucket.has_token_at(t) {
                return false;
            }
        }
    }
    true
}

/// Probe for the earliest feasible start `>= t0`, advancing by exponentially
/// doubling steps (1 ms, 2 ms, 4 ms, ...) starting from `t0` itself.
fn find_feasible_start(
    t0: f64,
    latency: f64,
    resources: &[ResourceAccess],
    concurrency_limit: usize,
    ir: &PlanIr,
    scheduled: &IndexMap<NodeId, Schedule>,
    buckets: &HashMap<String, Arc<TokenBucket>>,
    deadline_ms: f64,
) -> Option<f64> {
    let mut t = t0;
    let mut delta = 1.0_f64;
    for _ in 0..MAX_PROBES {
        if is_feasible(t, latency, resources, concurrency_limit, ir, scheduled, buckets, deadline_ms) {
            return Some(t);
        }
        t += delta;
        delta *= 2.0;
        if t > deadline_ms {
            return None;
        }
    }
    None
}

/// Phase C: HEFT-style list scheduling. At each step, the highest-rank ready
/// node (ties broken by ascending node id) is assigned its earliest feasible
/// start before `deadline_ms`. If the top-rank candidate cannot be placed in
/// time, the remaining ready nodes are tried in the same rank order as a
/// fallback — a source node (no predecessors) is the least constrained and
/// so the likeliest to still fit. If no ready node can be placed, compilation
/// fails with `ScheduleInfeasible` naming the original top-rank candidate.
fn phase_c_schedule(
    ir: &PlanIr,
    registry: &ToolRegistry,
    config: &CompilerConfig,
    rank: &IndexMap<NodeId, f64>,
    buckets: &HashMap<String, Arc<TokenBucket>>,
) -> CompileResult<IndexMap<NodeId, Schedule>> {
    let mut scheduled: IndexMap<NodeId, Schedule> = IndexMap::new();
    let mut remaining: IndexMap<NodeId, usize> = ir
        .nodes
        .keys()
        .map(|id| (id.clone(), ir.predecessors(id).len()))
        .collect();

    let total = ir.nodes.len();
    while scheduled.len() < total {
        let mut ready: Vec<NodeId> = remaining
            .iter()
            .filter(|(id, &count)| count == 0 && !scheduled.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort_by(|a, b| rank[a].partial_cmp(&rank[b]).unwrap().reverse().then_with(|| a.cmp(b)));

        let top_candidate = ready
            .first()
            .cloned()
            .expect("an acyclic DAG always has a ready node while unscheduled nodes remain");

        let mut placement = None;
        for candidate in &ready {
            let node = &ir.nodes[candidate];
            let preds = ir.predecessors(candidate);
            let t0 = preds
                .iter()
                .map(|p| scheduled[p].end_ms)
                .fold(0.0_f64, f64::max);
            let latency = ir.latency_ms(registry, candidate);

            if let Some(start) = find_feasible_start(
                t0,
                latency,
                &node.resources,
                config.concurrency_limit,
                ir,
                &scheduled,
                buckets,
                config.deadline_ms,
            ) {
                placement = Some((candidate.clone(), start, latency));
                break;
            }
        }

        let (node_id, start, latency) = placement.ok_or(CompileError::ScheduleInfeasible {
            deadline_ms: config.deadline_ms,
            node: top_candidate,
        })?;

        let node = &ir.nodes[&node_id];
        for access in &node.resources {
            if let Some(bucket) = buckets.get(&access.resource) {
                bucket.consume_at(start);
            }
        }

        for succ in ir.successors(&node_id) {
            if let Some(count) = remaining.get_mut(&succ) {
                *count -= 1;
            }
        }
        scheduled.insert(
            node_id,
            Schedule {
                start_ms: start,
                end_ms: start + latency,
            },
        );
    }

    Ok(scheduled)
}

/// Phase D (rate_penalty): slide a 1,000 ms window over each rate-limited
/// resource's scheduled start times, penalizing windows whose start count
/// exceeds the per-second limit.
fn phase_d_rate_penalty(
    ir: &PlanIr,
    config: &CompilerConfig,
    schedule: &IndexMap<NodeId, Schedule>,
) -> f64 {
    let mut penalty = 0.0;
    for (resource, &limit_per_sec) in &config.rate_limits {
        let starts: Vec<f64> = ir
            .nodes
            .iter()
            .filter(|(_, n)| n.resources.iter().any(|a| &a.resource == resource))
            .filter_map(|(id, _)| schedule.get(id).map(|s| s.start_ms))
            .collect();
        for &window_start in &starts {
            let count = starts
                .iter()
                .filter(|&&s| s >= window_start && s < window_start + 1000.0)
                .count() as f64;
            if count > limit_per_sec {
                penalty += (count - limit_per_sec).powi(2);
            }
        }
    }
    penalty
}

/// Phase D (retry_penalty): `Σ failure_prob · (failure_prob · max_retries) · latency`.
fn phase_d_retry_penalty(ir: &PlanIr, registry: &ToolRegistry) -> f64 {
    ir.nodes
        .iter()
        .map(|(id, n)| {
            let failure_prob = registry.get(&n.tool).map(|t| t.metadata.failure_prob).unwrap_or(0.0);
            let max_retries = n.retry.max_retries as f64;
            let latency = ir.latency_ms(registry, id);
            failure_prob * (failure_prob * max_retries) * latency
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::build_plan_ir;
    use crate::ir::{
        AccessMode, EffectType, Environment, ResourceAccess, RetryPolicy, SideEffect, Tool,
        ToolExecutor, ToolFailure, ToolMetadata, ToolOutcome,
    };
    use crate::value::{RefTarget, Value};
    use async_trait::async_trait;

    struct NoopExecutor;
    #[async_trait]
    impl ToolExecutor for NoopExecutor {
        async fn invoke(
            &self,
            _params: crate::value::ResolvedParams,
        ) -> Result<ToolOutcome, ToolFailure> {
            Ok(ToolOutcome {
                value: serde_json::json!(null),
            })
        }
    }

    fn tool(name: &str, latency_ms: f64, effect: EffectType, resources: &[(&str, AccessMode)]) -> Tool {
        Tool {
            name: name.to_string(),
            executor: Arc::new(NoopExecutor),
            effect: Some(effect),
            resources: resources
                .iter()
                .map(|(r, m)| ResourceAccess {
                    resource: r.to_string(),
                    mode: *m,
                })
                .collect(),
            expected_latency_ms: latency_ms,
            expected_cost: 0.0,
            metadata: ToolMetadata::default(),
        }
    }

    fn node(id: &str, tool: &str, effect: EffectType, resources: &[(&str, AccessMode)]) -> crate::ir::PlanNode {
        let side_effect = effect.side_effect;
        crate::ir::PlanNode {
            id: id.into(),
            tool: tool.to_string(),
            params: IndexMap::new(),
            effect,
            resources: resources
                .iter()
                .map(|(r, m)| ResourceAccess {
                    resource: r.to_string(),
                    mode: *m,
                })
                .collect(),
            retry: RetryPolicy::default(),
            idempotency_key: if side_effect == SideEffect::Pure {
                None
            } else {
                Some(format!("{id}-key"))
            },
            output_type: None,
            compensation: None,
        }
    }

    fn default_compiler_config() -> CompilerConfig {
        CompilerConfig {
            concurrency_limit: 4,
            deadline_ms: f64::INFINITY,
            rate_limits: HashMap::new(),
            rate_bursts: HashMap::new(),
        }
    }

    #[test]
    fn empty_plan_has_zero_critical_path() {
        let reg = ToolRegistry::new();
        let ir = build_plan_ir(vec![], &reg).unwrap();
        let compiled = compile(ir, &reg, &default_compiler_config()).unwrap();
        assert_eq!(compiled.critical_path_ms, 0.0);
        assert!(compiled.schedule.is_empty());
    }

    #[test]
    fn single_node_plan_has_zero_slack() {
        let reg = ToolRegistry::new();
        reg.register(tool("t", 7.0, EffectType::PURE_LOCAL, &[]));
        let n = node("a", "t", EffectType::PURE_LOCAL, &[]);
        let ir = build_plan_ir(vec![n], &reg).unwrap();
        let compiled = compile(ir, &reg, &default_compiler_config()).unwrap();
        assert_eq!(compiled.critical_path_ms, 7.0);
        assert_eq!(compiled.slack[&NodeId::from("a")], 0.0);
    }

    #[test]
    fn sequential_pipeline_schedules_back_to_back() {
        let reg = ToolRegistry::new();
        reg.register(tool(
            "read_a",
            10.0,
            EffectType {
                side_effect: SideEffect::Read,
                environment: Environment::Local,
            },
            &[("r1", AccessMode::R)],
        ));
        reg.register(tool(
            "write_b",
            20.0,
            EffectType {
                side_effect: SideEffect::Write,
                environment: Environment::Local,
            },
            &[("r1", AccessMode::W)],
        ));

        let a = node(
            "a",
            "read_a",
            EffectType {
                side_effect: SideEffect::Read,
                environment: Environment::Local,
            },
            &[("r1", AccessMode::R)],
        );
        let mut b = node(
            "b",
            "write_b",
            EffectType {
                side_effect: SideEffect::Write,
                environment: Environment::Local,
            },
            &[("r1", AccessMode::W)],
        );
        b.params.insert(
            "upstream".to_string(),
            Value::Ref {
                ref_: RefTarget("a".into(), None),
            },
        );

        let ir = build_plan_ir(vec![a, b], &reg).unwrap();
        let compiled = compile(ir, &reg, &default_compiler_config()).unwrap();

        let sa = compiled.schedule[&NodeId::from("a")];
        let sb = compiled.schedule[&NodeId::from("b")];
        assert_eq!((sa.start_ms, sa.end_ms), (0.0, 10.0));
        assert_eq!((sb.start_ms, sb.end_ms), (10.0, 30.0));
        assert_eq!(compiled.critical_path_ms, 30.0);
    }

    #[test]
    fn parallel_fan_out_respects_concurrency_limit() {
        let reg = ToolRegistry::new();
        reg.register(tool("source", 5.0, EffectType::PURE_LOCAL, &[]));
        reg.register(tool("leaf", 8.0, EffectType::PURE_LOCAL, &[]));

        let s = node("s", "source", EffectType::PURE_LOCAL, &[]);
        let mut l1 = node("l1", "leaf", EffectType::PURE_LOCAL, &[]);
        l1.params.insert(
            "x".into(),
            Value::Ref {
                ref_: RefTarget("s".into(), None),
            },
        );
        let mut l2 = node("l2", "leaf", EffectType::PURE_LOCAL, &[]);
        l2.params.insert(
            "x".into(),
            Value::Ref {
                ref_: RefTarget("s".into(), None),
            },
        );

        let ir = build_plan_ir(vec![s, l1, l2], &reg).unwrap();
        let mut cfg = default_compiler_config();
        cfg.concurrency_limit = 2;
        let compiled = compile(ir, &reg, &cfg).unwrap();

        assert_eq!(compiled.schedule[&NodeId::from("s")].start_ms, 0.0);
        assert_eq!(compiled.schedule[&NodeId::from("l1")].start_ms, 5.0);
        assert_eq!(compiled.schedule[&NodeId::from("l2")].start_ms, 5.0);
        assert_eq!(compiled.critical_path_ms, 13.0);
    }

    #[test]
    fn rate_limited_burst_staggers_after_capacity() {
        let reg = ToolRegistry::new();
        reg.register(tool(
            "read_api",
            1.0,
            EffectType {
                side_effect: SideEffect::Read,
                environment: Environment::External,
            },
            &[("api", AccessMode::R)],
        ));

        let nodes: Vec<_> = ["n1", "n2", "n3", "n4"]
            .iter()
            .map(|id| {
                node(
                    id,
                    "read_api",
                    EffectType {
                        side_effect: SideEffect::Read,
                        environment: Environment::External,
                    },
                    &[("api", AccessMode::R)],
                )
            })
            .collect();

        let ir = build_plan_ir(nodes, &reg).unwrap();
        let mut cfg = default_compiler_config();
        cfg.concurrency_limit = 4;
        cfg.rate_limits.insert("api".into(), 2.0);
        cfg.rate_bursts.insert("api".into(), 2.0);
        let compiled = compile(ir, &reg, &cfg).unwrap();

        let mut starts: Vec<f64> = compiled.schedule.values().map(|s| s.start_ms).collect();
        starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(starts[0], 0.0);
        assert_eq!(starts[1], 0.0);
        assert!(starts[2] >= 500.0);
        assert!(starts[3] >= 500.0);
    }

    #[test]
    fn tight_deadline_is_infeasible() {
        let reg = ToolRegistry::new();
        reg.register(tool("t", 10.0, EffectType::PURE_LOCAL, &[]));
        let n = node("a", "t", EffectType::PURE_LOCAL, &[]);
        let ir = build_plan_ir(vec![n], &reg).unwrap();
        let mut cfg = default_compiler_config();
        cfg.deadline_ms = 5.0;
        let err = compile(ir, &reg, &cfg).unwrap_err();
        assert!(matches!(err, CompileError::ScheduleInfeasible { .. }));
    }

    #[test]
    fn deadline_equal_to_critical_path_compiles() {
        let reg = ToolRegistry::new();
        reg.register(tool("t", 10.0, EffectType::PURE_LOCAL, &[]));
        let n = node("a", "t", EffectType::PURE_LOCAL, &[]);
        let ir = build_plan_ir(vec![n], &reg).unwrap();
        let mut cfg = default_compiler_config();
        cfg.deadline_ms = 10.0;
        let compiled = compile(ir, &reg, &cfg).unwrap();
        assert_eq!(compiled.critical_path_ms, 10.0);
    }
}
