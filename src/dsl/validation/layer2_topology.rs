//! Topology checks over the dependency graph.

use crate::dsl::schema::Plan;
use crate::graph;

use super::types::Diagnostic;

pub fn validate(plan: &Plan) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let dep_graph = graph::build_dependency_graph(plan);

    if dep_graph.is_cyclic() {
        let path = dep_graph
            .find_cycle()
            .map(|p| p.join(" -> "))
            .unwrap_or_else(|| "unknown".to_string());
        diags.push(Diagnostic::error(
            "E201",
            format!("plan graph contains a cycle: {path}"),
            None,
        ));
    }

    // A node referencing itself is a degenerate cycle petgraph's check misses
    // because self-edges are dropped at build time.
    for node in &plan.graph {
        if graph::node_references(node)
            .iter()
            .any(|(src, _)| src == &node.id)
        {
            diags.push(Diagnostic::error(
                "E202",
                "node references its own outputs".to_string(),
                Some(node.id.clone()),
            ));
        }
    }

    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};

    #[test]
    fn test_cycle_reported_with_path() {
        let plan = parse_plan(
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
            PlanFormat::Yaml,
        )
        .unwrap();
        let diags = validate(&plan);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, "E201");
        assert!(diags[0].message.contains("->"));
    }

    #[test]
    fn test_self_reference() {
        let plan = parse_plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.double
    in: { x: "${a.y}" }
    out: { y: y }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();
        let diags = validate(&plan);
        assert_eq!(diags[0].code, "E202");
    }

    #[test]
    fn test_acyclic_clean() {
        let plan = parse_plan(
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
    in: { x: "${a.v}" }
    out: { y: r }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();
        assert!(validate(&plan).is_empty());
    }
}
