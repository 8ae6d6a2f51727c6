//! Structural checks: document shape, id uniqueness, registry binding.

use std::collections::HashSet;

use crate::dsl::schema::{Node, NodeOutputs, Plan};
use crate::reference;
use crate::registry::BlockRegistry;

use super::types::Diagnostic;

pub fn validate(plan: &Plan, registry: &BlockRegistry) -> Vec<Diagnostic> {
    let mut diags = Vec::new();

    if plan.id.is_empty() {
        diags.push(Diagnostic::error("E100", "plan id is required", None));
    }
    if plan.version.is_empty() {
        diags.push(Diagnostic::error("E100", "plan version is required", None));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for node in &plan.graph {
        if !seen.insert(&node.id) {
            diags.push(Diagnostic::error(
                "E101",
                format!("duplicate node id: {}", node.id),
                Some(node.id.clone()),
            ));
        }
    }

    for node in &plan.graph {
        check_node_shape(node, &mut diags);
        if node.node_type.is_none() {
            check_registry_binding(node, registry, &mut diags);
        }
    }

    diags
}

fn check_node_shape(node: &Node, diags: &mut Vec<Diagnostic>) {
    let err = |code: &str, message: String| Diagnostic::error(code, message, Some(node.id.clone()));

    if node.is_loop() {
        match (&node.foreach, &node.while_) {
            (Some(_), Some(_)) => diags.push(err(
                "E110",
                "loop node sets both foreach and while".into(),
            )),
            (None, None) => diags.push(err(
                "E110",
                "loop node requires either foreach or while".into(),
            )),
            _ => {}
        }
        if node.body.is_none() {
            diags.push(err("E111", "loop node requires a body plan".into()));
        }
        if node.block.is_some() {
            diags.push(err("E112", "loop node must not reference a block".into()));
        }
    } else if node.is_subflow() {
        if node.call.is_none() {
            diags.push(err("E113", "subflow node requires call.plan_id".into()));
        }
        if node.block.is_some() {
            diags.push(err("E112", "subflow node must not reference a block".into()));
        }
        if matches!(node.outputs, Some(NodeOutputs::Aliases(_))) {
            diags.push(err(
                "E114",
                "subflow out must be an exports list".into(),
            ));
        }
    } else {
        if node.block.is_none() {
            diags.push(err("E115", "block node requires a block id".into()));
        }
        if node.foreach.is_some() || node.while_.is_some() || node.body.is_some() {
            diags.push(err(
                "E116",
                "loop fields are only valid on nodes with type: loop".into(),
            ));
        }
        if node.call.is_some() {
            diags.push(err(
                "E116",
                "call is only valid on nodes with type: subflow".into(),
            ));
        }
    }
}

fn check_registry_binding(node: &Node, registry: &BlockRegistry, diags: &mut Vec<Diagnostic>) {
    let Some(block_id) = &node.block else {
        return;
    };
    let spec = match registry.resolve_spec(block_id, None) {
        Ok(spec) => spec,
        Err(_) => {
            diags.push(Diagnostic::error(
                "E120",
                format!("unknown block id: {block_id}"),
                Some(node.id.clone()),
            ));
            return;
        }
    };

    for missing in spec.missing_env_requirements() {
        diags.push(Diagnostic::warning(
            "W125",
            format!("block '{}' requires env '{missing}' which is not set", spec.id),
            Some(node.id.clone()),
        ));
    }

    for key in node.inputs.keys() {
        if !spec.inputs.contains_key(key) {
            diags.push(
                Diagnostic::error(
                    "E121",
                    format!("input '{key}' not defined in block spec '{}'", spec.id),
                    Some(node.id.clone()),
                )
                .with_field(format!("in.{key}")),
            );
        }
    }

    // Required inputs must be bound unless the spec declares a default or the
    // binding arrives through vars overrides at run time.
    for (key, field) in &spec.inputs {
        if field.is_required() && field.default.is_none() && !node.inputs.contains_key(key) {
            diags.push(
                Diagnostic::error(
                    "E122",
                    format!("required input '{key}' of block '{}' is not bound", spec.id),
                    Some(node.id.clone()),
                )
                .with_field(format!("in.{key}")),
            );
        }
    }

    if let Some(NodeOutputs::Aliases(aliases)) = &node.outputs {
        for local_key in aliases.keys() {
            if !spec.outputs.contains_key(local_key) {
                diags.push(
                    Diagnostic::error(
                        "E123",
                        format!("output '{local_key}' not defined in block spec '{}'", spec.id),
                        Some(node.id.clone()),
                    )
                    .with_field(format!("out.{local_key}")),
                );
            }
        }
    }

    // Literal enum enforcement for scalar bindings.
    for (key, value) in &node.inputs {
        let Some(field) = spec.inputs.get(key) else {
            continue;
        };
        let Some(allowed) = &field.enum_values else {
            continue;
        };
        let is_scalar_literal = matches!(
            value,
            serde_json::Value::String(_)
                | serde_json::Value::Number(_)
                | serde_json::Value::Bool(_)
        );
        let has_placeholder = value
            .as_str()
            .map(|s| !reference::extract_placeholders(s).is_empty())
            .unwrap_or(false);
        if is_scalar_literal && !has_placeholder && !allowed.contains(value) {
            diags.push(
                Diagnostic::error(
                    "E124",
                    format!("input '{key}' value {value} not in enum {allowed:?}"),
                    Some(node.id.clone()),
                )
                .with_field(format!("in.{key}")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};

    fn diags(yaml: &str) -> Vec<Diagnostic> {
        let plan = parse_plan(yaml, PlanFormat::Yaml).unwrap();
        validate(&plan, &BlockRegistry::with_builtins())
    }

    fn codes(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_clean_plan() {
        let found = diags(
            r#"
id: ok
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 1 }
    out: { value: v }
"#,
        );
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn test_duplicate_ids_and_missing_block() {
        let found = diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
  - id: a
    block: test.constant
  - id: b
"#,
        );
        let codes = codes(&found);
        assert!(codes.contains(&"E101"));
        assert!(codes.contains(&"E115"));
    }

    #[test]
    fn test_unknown_block_and_io_keys() {
        let found = diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: no.such.block
  - id: b
    block: test.double
    in: { x: 1, bogus: 2 }
    out: { y: r, nope: z }
"#,
        );
        let codes = codes(&found);
        assert!(codes.contains(&"E120"));
        assert!(codes.contains(&"E121"));
        assert!(codes.contains(&"E123"));
    }

    #[test]
    fn test_required_input_missing() {
        let found = diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: b
    block: test.double
    out: { y: r }
"#,
        );
        assert!(codes(&found).contains(&"E122"));
    }

    #[test]
    fn test_loop_shape() {
        let found = diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: l
    type: loop
    out: { collect: xs }
"#,
        );
        let codes = codes(&found);
        assert!(codes.contains(&"E110"));
        assert!(codes.contains(&"E111"));
    }

    #[test]
    fn test_enum_enforcement() {
        let found = diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: u
    block: ui.interactive_input
    in: { mode: bogus_mode }
"#,
        );
        assert!(codes(&found).contains(&"E124"));
    }
}
