//! Dependency graph extraction.
//!
//! Edges are discovered by scanning every value under a node's `in`, `when`,
//! `foreach`, `while`, and `call.inputs` for `${node.alias[...]}` placeholders.
//! References to `vars`/`env`/`config` never produce edges. The result drives
//! cycle detection in the validator and ready-node discovery in the runner.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde_json::Value;

use crate::dsl::schema::{Guard, Node, Plan};
use crate::error::PlanError;
use crate::reference::{self, Reference, RefRoot};

/// Immutable dependency DAG over node ids.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    /// Producer nodes this node depends on.
    pub fn dependencies_of(&self, node_id: &str) -> Vec<String> {
        let Some(idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*idx, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// Consumer nodes depending on this node.
    pub fn dependents_of(&self, node_id: &str) -> Vec<String> {
        let Some(idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// One cycle path for diagnostics, if any exists.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut state: HashMap<&str, u8> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();
        for start in self.index.keys() {
            if state.get(start.as_str()).copied().unwrap_or(0) == 0 {
                if let Some(cycle) = self.dfs_cycle(start, &mut state, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        state: &mut HashMap<&'a str, u8>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        state.insert(node, 1);
        stack.push(node.to_string());
        for next in self.dependents_of(node) {
            let next_key = self.index.get_key_value(&next).map(|(k, _)| k.as_str())?;
            match state.get(next_key).copied().unwrap_or(0) {
                0 => {
                    if let Some(cycle) = self.dfs_cycle(next_key, state, stack) {
                        return Some(cycle);
                    }
                }
                1 => {
                    if let Some(pos) = stack.iter().position(|n| n == &next) {
                        let mut path = stack[pos..].to_vec();
                        path.push(next);
                        return Some(path);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        state.insert(node, 2);
        None
    }

    /// Topological order of node ids, or a cycle error.
    pub fn topo_order(&self) -> Result<Vec<String>, PlanError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .map_err(|_| {
                let path = self
                    .find_cycle()
                    .map(|p| p.join(" -> "))
                    .unwrap_or_else(|| "unknown".to_string());
                PlanError::CycleDetected(path)
            })
    }
}

/// Build the dependency graph for a plan.
pub fn build_dependency_graph(plan: &Plan) -> DependencyGraph {
    let mut graph = StableDiGraph::new();
    let mut index = HashMap::new();
    for node in &plan.graph {
        let idx = graph.add_node(node.id.clone());
        index.insert(node.id.clone(), idx);
    }

    for node in &plan.graph {
        let dest = index[&node.id];
        let mut seen: HashSet<String> = HashSet::new();
        for (src, _) in node_references(node) {
            if !seen.insert(src.clone()) {
                continue;
            }
            // Unknown producers are the validator's concern, not an edge.
            if let Some(&src_idx) = index.get(&src) {
                if src_idx != dest {
                    graph.add_edge(src_idx, dest, ());
                }
            }
        }
    }

    DependencyGraph { graph, index }
}

/// Every `(producer_node, reference)` pair found anywhere in a node's
/// reference-bearing fields.
pub fn node_references(node: &Node) -> Vec<(String, Reference)> {
    let mut refs = Vec::new();
    for value in node.inputs.values() {
        reference::collect_node_refs(value, &mut refs);
    }
    if let Some(guard) = &node.when {
        collect_guard_refs(guard, &mut refs);
    }
    if let Some(foreach) = &node.foreach {
        reference::collect_node_refs(&foreach.input, &mut refs);
    }
    if let Some(while_) = &node.while_ {
        collect_guard_refs(&while_.condition, &mut refs);
    }
    if let Some(call) = &node.call {
        for value in call.inputs.values() {
            reference::collect_node_refs(value, &mut refs);
        }
    }
    refs
}

fn collect_guard_refs(guard: &Guard, refs: &mut Vec<(String, Reference)>) {
    match guard {
        Guard::Expr { expr } => {
            for inner in reference::extract_placeholders(expr) {
                let parsed = Reference::parse(&inner);
                if let RefRoot::Node(node_id) = &parsed.root {
                    if !parsed.path.is_empty() {
                        refs.push((node_id.clone(), parsed));
                    }
                }
            }
        }
        Guard::Comparison { left, right, .. } => {
            reference::collect_node_refs(left, refs);
            reference::collect_node_refs(right, refs);
        }
        Guard::Literal(value) => reference::collect_node_refs(value, refs),
    }
}

/// Collect references from an arbitrary value tree; thin re-export used by
/// the validator.
pub fn value_references(value: &Value) -> Vec<(String, Reference)> {
    let mut refs = Vec::new();
    reference::collect_node_refs(value, &mut refs);
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};

    fn plan(yaml: &str) -> Plan {
        parse_plan(yaml, PlanFormat::Yaml).unwrap()
    }

    #[test]
    fn test_linear_dependencies() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 7 }
    out: { value: v }
  - id: b
    block: test.double
    in: { x: "${a.v}" }
    out: { y: r }
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert_eq!(graph.dependencies_of("b"), vec!["a".to_string()]);
        assert!(graph.dependencies_of("a").is_empty());
        assert_eq!(graph.topo_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_guard_and_loop_edges() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: src
    block: test.constant
    in: { value: [1, 2] }
    out: { value: items }
  - id: guard_user
    block: test.double
    in: { x: 1 }
    when: { expr: "${src.items} != null" }
    out: { y: r }
  - id: loop
    type: loop
    foreach: { input: "${src.items}" }
    out: { collect: all }
    body:
      plan:
        graph: []
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert_eq!(graph.dependencies_of("guard_user"), vec!["src".to_string()]);
        assert_eq!(graph.dependencies_of("loop"), vec!["src".to_string()]);
    }

    #[test]
    fn test_vars_env_config_produce_no_edges() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
vars: { k: 1 }
graph:
  - id: a
    block: test.constant
    in: { value: "${vars.k}", path: "${env.HOME}", cfg: "${config.app.key}" }
    out: { value: v }
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert!(graph.dependencies_of("a").is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.double
    in: { x: "${b.y}" }
    out: { y: ya }
  - id: b
    block: test.double
    in: { x: "${a.ya}" }
    out: { y: y }
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert!(graph.is_cyclic());
        let cycle = graph.find_cycle().unwrap();
        assert!(cycle.len() >= 3);
        assert!(matches!(
            graph.topo_order(),
            Err(PlanError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_duplicate_references_single_edge() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 1 }
    out: { value: v }
  - id: b
    block: test.double
    in: { x: "${a.v}", again: "${a.v}" }
    out: { y: r }
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert_eq!(graph.dependencies_of("b").len(), 1);
    }

    #[test]
    fn test_subflow_call_inputs_edges() {
        let plan = plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 1 }
    out: { value: v }
  - id: sub
    type: subflow
    call: { plan_id: child, inputs: { seed: "${a.v}" } }
    out: { exports: [ { from: total, as: sum } ] }
"#,
        );
        let graph = build_dependency_graph(&plan);
        assert_eq!(graph.dependencies_of("sub"), vec!["a".to_string()]);
    }
}
