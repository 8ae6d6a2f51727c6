//! Plan document schema.
//!
//! A [`Plan`] is a declarative DAG of [`Node`]s plus policy and UI hints.
//! Insertion order of `graph` is a display hint, not an execution order; the
//! runner derives execution order from placeholder references.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Top-level plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, alias = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Empty only for inline loop bodies; the validator rejects empty ids on
    /// top-level plans.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiConfig>,
    #[serde(default)]
    pub graph: Vec<Node>,
    /// Exports surfaced to the enclosing scope when this plan runs as a loop
    /// body or subflow child.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<Export>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.graph.iter().find(|n| n.id == node_id)
    }

    /// Position of a node in the UI layout, if listed.
    pub fn layout_position(&self, node_id: &str) -> Option<usize> {
        self.ui
            .as_ref()
            .and_then(|ui| ui.layout.iter().position(|id| id == node_id))
    }

    /// Apply this plan's `exports` directives to an alias surface. A plan
    /// without exports surfaces every alias.
    pub fn exported_surface(&self, alias_surface: &Map<String, Value>) -> Map<String, Value> {
        if self.exports.is_empty() {
            return alias_surface.clone();
        }
        let mut exported = Map::new();
        for export in &self.exports {
            if let Some(value) = alias_surface.get(&export.from) {
                exported.insert(export.alias.clone(), value.clone());
            }
        }
        exported
    }
}

/// UI rendering hints: ordered list of user-facing node ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default)]
    pub layout: Vec<String>,
}

/// Failure handling selected by plan or node policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Halt,
    Continue,
    Retry,
}

/// Retry/timeout/concurrency policy. A node-level policy overrides the plan
/// policy for that node only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyPolicy>,
}

impl Policy {
    pub fn max_workers(&self) -> usize {
        self.concurrency
            .as_ref()
            .map(|c| c.default_max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS)
    }
}

pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

/// Control-flow node kinds beyond plain block nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Loop,
    Subflow,
}

/// A single node of the plan graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Block id for block nodes, optionally version-pinned as `id@semver`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(rename = "in", default)]
    pub inputs: Map<String, Value>,
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<NodeOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Guard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForeachSpec>,
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<WhileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<LoopBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<SubflowCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    /// Advisory hint: clamps the worker pool while this node is schedulable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Advisory hint: ready-set tie-breaker, lower runs earlier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl Node {
    pub fn is_loop(&self) -> bool {
        self.node_type == Some(NodeType::Loop)
    }

    pub fn is_subflow(&self) -> bool {
        self.node_type == Some(NodeType::Subflow)
    }

    /// Alias map `{local_output: alias}` for block and loop nodes.
    pub fn alias_map(&self) -> Option<&BTreeMap<String, String>> {
        match &self.outputs {
            Some(NodeOutputs::Aliases(map)) => Some(map),
            _ => None,
        }
    }

    /// Export list for subflow nodes.
    pub fn export_list(&self) -> Option<&[Export]> {
        match &self.outputs {
            Some(NodeOutputs::Exports { exports }) => Some(exports),
            _ => None,
        }
    }

    /// Aliases this node makes visible to downstream references.
    pub fn produced_aliases(&self) -> Vec<String> {
        match &self.outputs {
            Some(NodeOutputs::Aliases(map)) => map.values().cloned().collect(),
            Some(NodeOutputs::Exports { exports }) => {
                exports.iter().map(|e| e.alias.clone()).collect()
            }
            None => Vec::new(),
        }
    }
}

/// Output mapping. Block and loop nodes map local output names to aliases;
/// subflow nodes list explicit exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeOutputs {
    Exports { exports: Vec<Export> },
    Aliases(BTreeMap<String, String>),
}

/// One exported value: `from` names a child alias, `as` the name visible to
/// the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub from: String,
    #[serde(rename = "as")]
    pub alias: String,
}

/// Guard attached to a node (`when`) or a while loop (`condition`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Guard {
    Expr {
        expr: String,
    },
    Comparison {
        left: Value,
        op: CompareOp,
        right: Value,
    },
    /// Bare literal; evaluated for truthiness.
    Literal(Value),
}

/// Operators accepted by the structured comparison guard form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Foreach loop specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachSpec {
    pub input: Value,
    #[serde(default = "default_item_var", alias = "itemVar")]
    pub item_var: String,
    #[serde(default = "default_index_var", alias = "indexVar")]
    pub index_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

/// While loop specification. `max_iterations` is kept optional at the schema
/// level so the validator can report its absence instead of failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileSpec {
    pub condition: Guard,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<i64>,
}

/// Nested body plan of a loop node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBody {
    pub plan: Plan,
}

/// Subflow invocation: child plan id plus the variable overrides it receives.
/// The child inherits nothing else from the parent scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowCall {
    pub plan_id: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_outputs_aliases() {
        let node: Node = serde_json::from_value(json!({
            "id": "a",
            "block": "test.constant",
            "in": {"value": 7},
            "out": {"value": "v"}
        }))
        .unwrap();
        assert_eq!(node.alias_map().unwrap().get("value").unwrap(), "v");
        assert_eq!(node.produced_aliases(), vec!["v".to_string()]);
    }

    #[test]
    fn test_node_outputs_exports() {
        let node: Node = serde_json::from_value(json!({
            "id": "sub",
            "type": "subflow",
            "call": {"plan_id": "child", "inputs": {"x": 1}},
            "out": {"exports": [{"from": "total", "as": "sum"}]}
        }))
        .unwrap();
        assert!(node.is_subflow());
        let exports = node.export_list().unwrap();
        assert_eq!(exports[0].from, "total");
        assert_eq!(exports[0].alias, "sum");
        assert_eq!(node.produced_aliases(), vec!["sum".to_string()]);
    }

    #[test]
    fn test_guard_forms() {
        let g: Guard = serde_json::from_value(json!({"expr": "${a.v} > 10"})).unwrap();
        assert!(matches!(g, Guard::Expr { .. }));

        let g: Guard =
            serde_json::from_value(json!({"left": "${a.v}", "op": "gte", "right": 3})).unwrap();
        match g {
            Guard::Comparison { op, .. } => assert_eq!(op, CompareOp::Gte),
            _ => panic!("expected comparison"),
        }

        let g: Guard = serde_json::from_value(json!(true)).unwrap();
        assert!(matches!(g, Guard::Literal(Value::Bool(true))));
    }

    #[test]
    fn test_foreach_defaults_and_aliases() {
        let spec: ForeachSpec =
            serde_json::from_value(json!({"input": "${a.list}", "itemVar": "it"})).unwrap();
        assert_eq!(spec.item_var, "it");
        assert_eq!(spec.index_var, "index");
        assert!(spec.max_concurrency.is_none());
    }

    #[test]
    fn test_policy_defaults() {
        let policy: Policy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy.on_error, OnError::Halt);
        assert_eq!(policy.retries, 0);
        assert_eq!(policy.max_workers(), DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn test_plan_api_version_alias() {
        let plan: Plan = serde_json::from_value(json!({
            "apiVersion": "v1",
            "id": "p",
            "version": "0.1.0",
            "graph": []
        }))
        .unwrap();
        assert_eq!(plan.api_version.as_deref(), Some("v1"));
    }

    #[test]
    fn test_layout_position() {
        let plan: Plan = serde_json::from_value(json!({
            "id": "p",
            "version": "0.1.0",
            "ui": {"layout": ["u1", "u2"]},
            "graph": [{"id": "u1"}, {"id": "u2"}]
        }))
        .unwrap();
        assert_eq!(plan.layout_position("u2"), Some(1));
        assert_eq!(plan.layout_position("missing"), None);
    }
}
