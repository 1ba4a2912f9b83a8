//! The tagged-variant parameter value carried in [`crate::ir::PlanNode`] params.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ir::NodeId;

/// A heterogeneous parameter value: a literal, a reference to an upstream
/// node's output, or a nested map/list of the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A reference to (all of, or a field of) an upstream node's output.
    Ref {
        /// The `{"ref": [node_id, field]}` wire form.
        #[serde(rename = "ref")]
        ref_: RefTarget,
    },
    /// An ordered map of named values (preserves key order for deterministic wire round-trips).
    Map(IndexMap<String, Value>),
    /// A list of values.
    List(Vec<Value>),
    /// Any JSON scalar: string, number, bool, or null.
    Literal(serde_json::Value),
}

/// The `(node_id, field)` pair inside a `ref` parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefTarget(pub NodeId, pub Option<String>);

impl Value {
    /// Walks this value (and, recursively, any nested map/list) collecting every
    /// node referenced by a `ref`. Used to build data edges during IR construction.
    pub fn collect_refs(&self, out: &mut Vec<RefTarget>) {
        match self {
            Value::Ref { ref_ } => out.push(ref_.clone()),
            Value::Map(m) => m.values().for_each(|v| v.collect_refs(out)),
            Value::List(l) => l.iter().for_each(|v| v.collect_refs(out)),
            Value::Literal(_) => {}
        }
    }

    /// True if this value is a direct reference (not nested inside a map/list).
    pub fn as_ref_target(&self) -> Option<&RefTarget> {
        match self {
            Value::Ref { ref_ } => Some(ref_),
            _ => None,
        }
    }
}

/// A resolved parameter bag: every `Ref` has been replaced by the concrete
/// JSON value it resolved to.
pub type ResolvedParams = IndexMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_nested_refs() {
        let mut inner = IndexMap::new();
        inner.insert(
            "x".to_string(),
            Value::Ref {
                ref_: RefTarget("a".into(), Some("field".into())),
            },
        );
        let v = Value::List(vec![Value::Map(inner), Value::Literal(serde_json::json!(1))]);
        let mut out = Vec::new();
        v.collect_refs(&mut out);
        assert_eq!(out, vec![RefTarget("a".into(), Some("field".into()))]);
    }
}
