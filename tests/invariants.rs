//! Property tests over the invariants listed in the design document's
//! testable-properties section: edge ordering must be respected by the
//! compiled schedule, and no more than `concurrency_limit` scheduled
//! intervals may overlap at any point.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use proptest::prelude::*;

use planforge::{
    build_plan_ir, compile, AccessMode, CompilerConfig, EffectType, Environment, PlanNode,
    RefTarget, ResourceAccess, RetryPolicy, SideEffect, Tool, ToolExecutor, ToolFailure,
    ToolMetadata, ToolOutcome, ToolRegistry, Value,
};

struct NoopExecutor;

#[async_trait]
impl ToolExecutor for NoopExecutor {
    async fn invoke(
        &self,
        _params: planforge::ResolvedParams,
    ) -> Result<ToolOutcome, ToolFailure> {
        Ok(ToolOutcome {
            value: serde_json::Value::Null,
        })
    }
}

/// A chain of nodes n0 -> n1 -> ... -> n(k-1), each referencing its
/// predecessor's output, each accessing one of two shared resources in a
/// randomly chosen read/write mode.
fn build_chain(accesses: &[(bool, bool)]) -> (planforge::PlanIr, ToolRegistry, usize) {
    let registry = ToolRegistry::new();
    let mut nodes = Vec::new();

    for (i, &(is_write, use_x)) in accesses.iter().enumerate() {
        let mode = if is_write { AccessMode::W } else { AccessMode::R };
        let side_effect = if is_write { SideEffect::Write } else { SideEffect::Read };
        let resource = if use_x { "x" } else { "y" };
        let tool_name = format!("t{i}");
        let effect = EffectType {
            side_effect,
            environment: Environment::Local,
        };
        registry.register(Tool {
            name: tool_name.clone(),
            executor: Arc::new(NoopExecutor),
            effect: Some(effect),
            resources: vec![ResourceAccess {
                resource: resource.to_string(),
                mode,
            }],
            expected_latency_ms: 3.0,
            expected_cost: 0.0,
            metadata: ToolMetadata::default(),
        });

        let mut params = IndexMap::new();
        if i > 0 {
            params.insert(
                "upstream".to_string(),
                Value::Ref {
                    ref_: RefTarget(format!("n{}", i - 1).into(), None),
                },
            );
        }

        nodes.push(PlanNode {
            id: format!("n{i}").into(),
            tool: tool_name,
            params,
            effect,
            resources: vec![ResourceAccess {
                resource: resource.to_string(),
                mode,
            }],
            retry: RetryPolicy::default(),
            // Both READ and WRITE are non-PURE; every node here needs a key.
            idempotency_key: Some(format!("n{i}-key")),
            output_type: None,
            compensation: None,
        });
    }

    let count = nodes.len();
    let ir = build_plan_ir(nodes, &registry).unwrap();
    (ir, registry, count)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn schedule_respects_every_edge_and_concurrency_limit(
        accesses in prop::collection::vec((any::<bool>(), any::<bool>()), 2..8),
        concurrency_limit in 1usize..4,
    ) {
        let (ir, registry, _count) = build_chain(&accesses);
        let mut cfg = CompilerConfig::default();
        cfg.concurrency_limit = concurrency_limit;

        let compiled = compile(ir, &registry, &cfg).unwrap();

        for (u, v) in compiled.plan.all_edges() {
            let su = compiled.schedule[u];
            let sv = compiled.schedule[v];
            prop_assert!(su.end_ms <= sv.start_ms, "edge {:?} -> {:?} violated: {:?} vs {:?}", u, v, su, sv);
        }

        let mut boundaries: Vec<f64> = compiled.schedule.values().map(|s| s.start_ms).collect();
        boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for &t in &boundaries {
            let overlapping = compiled
                .schedule
                .values()
                .filter(|s| s.start_ms <= t && t < s.end_ms)
                .count();
            prop_assert!(overlapping <= concurrency_limit, "{} intervals overlap at t={} with limit {}", overlapping, t, concurrency_limit);
        }
    }
}
