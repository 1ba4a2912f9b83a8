//! C2: Plan IR construction and semantic consistency checking.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::{IrError, IrResult};
use crate::ir::{NodeId, PlanIr, PlanNode};
use crate::registry::ToolRegistry;

/// Accepts or rejects a data edge based on the upstream/downstream output type
/// tags. The default, [`IdentityTypeChecker`], accepts everything.
pub trait TypeChecker: Send + Sync {
    /// Whether a value typed `upstream` may flow into a parameter typed `downstream`.
    fn check(&self, upstream: Option<&str>, downstream: Option<&str>) -> bool;
}

/// Accepts any pairing of output types; used when no type checker is supplied.
pub struct IdentityTypeChecker;

impl TypeChecker for IdentityTypeChecker {
    fn check(&self, _upstream: Option<&str>, _downstream: Option<&str>) -> bool {
        true
    }
}

/// Kahn's algorithm over an explicit node/edge set, breaking ties by ascending
/// node id so the ordering is stable across runs. Returns `CycleDetected` if
/// the edge set is not acyclic.
pub(crate) fn topological_order(
    ids: &[NodeId],
    edges: &[(NodeId, NodeId)],
) -> IrResult<Vec<NodeId>> {
    let mut in_degree: HashMap<&NodeId, usize> = ids.iter().map(|id| (id, 0)).collect();
    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for (u, v) in edges {
        adjacency.entry(u).or_default().push(v);
        *in_degree.entry(v).or_insert(0) += 1;
    }

    let mut ready: BinaryHeap<Reverse<&NodeId>> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.clone());
        if let Some(succs) = adjacency.get(id) {
            for succ in succs {
                let deg = in_degree.get_mut(succ).expect("successor tracked");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }
    }

    if order.len() != ids.len() {
        let stuck = ids
            .iter()
            .find(|id| !order.contains(id))
            .cloned()
            .unwrap_or_else(|| ids[0].clone());
        return Err(IrError::CycleDetected(stuck));
    }
    Ok(order)
}

/// Build a [`PlanIr`] from a flat list of nodes.
///
/// 1. Data edges are derived from `ref` parameters.
/// 2. Nodes are ordered topologically over data edges alone (fails on cycle).
/// 3. Resource edges are added for each ordered pair sharing a conflicting access.
/// 4. The resulting IR carries empty sync edges; those are added by the compiler.
pub fn build_plan_ir(nodes: Vec<PlanNode>, registry: &ToolRegistry) -> IrResult<PlanIr> {
    let mut seen = HashSet::new();
    for n in &nodes {
        if !seen.insert(n.id.clone()) {
            return Err(IrError::DuplicateNodeId(n.id.clone()));
        }
    }
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    let id_set: HashSet<&NodeId> = ids.iter().collect();

    for n in &nodes {
        if registry.get(&n.tool).is_none() {
            return Err(IrError::UnknownTool {
                node: n.id.clone(),
                tool: n.tool.clone(),
            });
        }
    }

    let mut data_edges = Vec::new();
    for n in &nodes {
        let mut refs = Vec::new();
        for v in n.params.values() {
            v.collect_refs(&mut refs);
        }
        for r in refs {
            if !id_set.contains(&r.0) {
                return Err(IrError::UnknownReference {
                    from: n.id.clone(),
                    to: r.0.clone(),
                });
            }
            data_edges.push((r.0, n.id.clone()));
        }
    }

    let data_order = topological_order(&ids, &data_edges)?;

    let mut resource_edges = Vec::new();
    for (i, u) in data_order.iter().enumerate() {
        let u_node = &nodes[ids.iter().position(|id| id == u).unwrap()];
        let u_resources = registry.infer_resources(&u_node.tool);
        for v in &data_order[i + 1..] {
            let v_node = &nodes[ids.iter().position(|id| id == v).unwrap()];
            let v_resources = registry.infer_resources(&v_node.tool);
            let conflicts = u_resources
                .iter()
                .any(|a| v_resources.iter().any(|b| a.conflicts_with(b)));
            if conflicts {
                resource_edges.push((u.clone(), v.clone()));
            }
        }
    }

    let mut by_id: HashMap<NodeId, PlanNode> =
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    let mut ordered_nodes = IndexMap::with_capacity(data_order.len());
    for id in data_order {
        let node = by_id.remove(&id).expect("node present");
        ordered_nodes.insert(id, node);
    }

    Ok(PlanIr {
        nodes: ordered_nodes,
        data_edges,
        resource_edges,
        sync_edges: Vec::new(),
    })
}

/// Check the five semantic consistency conditions over an already-constructed IR.
/// Returns the first violation found, in the order the properties are listed
/// in the design document.
pub fn check_semantic_consistency(
    ir: &PlanIr,
    registry: &ToolRegistry,
    type_checker: &dyn TypeChecker,
) -> IrResult<()> {
    let ids: Vec<NodeId> = ir.nodes.keys().cloned().collect();
    let all_edges: Vec<(NodeId, NodeId)> = ir.all_edges().cloned().collect();
    topological_order(&ids, &all_edges)?;

    for (u, v) in &ir.data_edges {
        let upstream_ty = ir.nodes[u].output_type.as_deref();
        let downstream_ty = ir.nodes[v].output_type.as_deref();
        if !type_checker.check(upstream_ty, downstream_ty) {
            return Err(IrError::TypeMismatch {
                from: u.clone(),
                to: v.clone(),
                reason: format!(
                    "{:?} -> {:?} rejected by type checker",
                    upstream_ty, downstream_ty
                ),
            });
        }
    }

    for node in ir.nodes.values() {
        let inferred_resources = registry.infer_resources(&node.tool);
        let under_declared = inferred_resources
            .iter()
            .any(|r| !node.resources.contains(r));
        if under_declared {
            return Err(IrError::ResourceUnderDeclared {
                node: node.id.clone(),
                tool: node.tool.clone(),
            });
        }

        let inferred_effect = registry.infer_effect(&node.tool);
        if !node.effect.dominates(&inferred_effect) {
            return Err(IrError::EffectUnderDeclared {
                node: node.id.clone(),
                tool: node.tool.clone(),
            });
        }

        if node.effect.side_effect != crate::ir::SideEffect::Pure && node.idempotency_key.is_none()
        {
            return Err(IrError::MissingIdempotencyKey(node.id.clone()));
        }
    }

    Ok(())
}
