//! Semantic checks: reference resolvability, guard syntax, loop and subflow
//! preconditions, UI layout consistency.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::config::ConfigStore;
use crate::dsl::parser::PlanLookup;
use crate::dsl::schema::{Guard, Node, Plan};
use crate::evaluator;
use crate::reference::{self, RefRoot, Reference};
use crate::registry::BlockRegistry;

use super::types::Diagnostic;

#[derive(Default)]
pub struct SemanticOptions<'a> {
    pub config: Option<&'a ConfigStore>,
    pub plan_lookup: Option<&'a dyn PlanLookup>,
    /// Unknown `${env.*}` keys error so misconfigured runs fail early; tests
    /// may relax this.
    pub skip_env_check: bool,
}

pub fn validate(
    plan: &Plan,
    registry: &BlockRegistry,
    opts: &SemanticOptions<'_>,
) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let surfaces = produced_surfaces(plan, registry);

    for node in &plan.graph {
        check_references(plan, node, registry, opts, &surfaces, &mut diags);
        check_guards(node, &mut diags);
        check_loop_preconditions(plan, node, opts, &mut diags);
        check_subflow(node, opts, &mut diags);
    }

    check_ui_layout(plan, &mut diags);
    diags
}

/// First-segment reference surface each node exposes downstream: declared
/// aliases plus local output keys.
fn produced_surfaces(plan: &Plan, registry: &BlockRegistry) -> HashMap<String, HashSet<String>> {
    let mut surfaces = HashMap::new();
    for node in &plan.graph {
        let mut surface: HashSet<String> = node.produced_aliases().into_iter().collect();
        if node.is_loop() {
            surface.insert("collect".to_string());
        } else if node.node_type.is_none() {
            if let Some(block_id) = &node.block {
                if let Ok(spec) = registry.resolve_spec(block_id, None) {
                    surface.extend(spec.outputs.keys().cloned());
                }
            }
        }
        surfaces.insert(node.id.clone(), surface);
    }
    surfaces
}

/// All placeholders a node carries, across inputs, guards, loop specs, and
/// subflow call inputs.
fn all_placeholders(node: &Node) -> Vec<Reference> {
    let mut texts: Vec<String> = Vec::new();
    fn collect_texts(value: &Value, texts: &mut Vec<String>) {
        match value {
            Value::String(s) => texts.extend(reference::extract_placeholders(s)),
            Value::Array(items) => items.iter().for_each(|v| collect_texts(v, texts)),
            Value::Object(map) => map.values().for_each(|v| collect_texts(v, texts)),
            _ => {}
        }
    }
    fn collect_guard(guard: &Guard, texts: &mut Vec<String>) {
        match guard {
            Guard::Expr { expr } => texts.extend(reference::extract_placeholders(expr)),
            Guard::Comparison { left, right, .. } => {
                collect_texts(left, texts);
                collect_texts(right, texts);
            }
            Guard::Literal(value) => collect_texts(value, texts),
        }
    }

    for value in node.inputs.values() {
        collect_texts(value, &mut texts);
    }
    if let Some(guard) = &node.when {
        collect_guard(guard, &mut texts);
    }
    if let Some(foreach) = &node.foreach {
        collect_texts(&foreach.input, &mut texts);
    }
    if let Some(while_) = &node.while_ {
        collect_guard(&while_.condition, &mut texts);
    }
    if let Some(call) = &node.call {
        for value in call.inputs.values() {
            collect_texts(value, &mut texts);
        }
    }
    texts.iter().map(|t| Reference::parse(t)).collect()
}

fn check_references(
    plan: &Plan,
    node: &Node,
    registry: &BlockRegistry,
    opts: &SemanticOptions<'_>,
    surfaces: &HashMap<String, HashSet<String>>,
    diags: &mut Vec<Diagnostic>,
) {
    for reference in all_placeholders(node) {
        match &reference.root {
            RefRoot::Vars => {
                if !vars_path_exists(&plan.vars, &reference.path) {
                    diags.push(Diagnostic::error(
                        "E301",
                        format!("reference to undefined variable '${{{}}}'", reference.raw),
                        Some(node.id.clone()),
                    ));
                }
            }
            RefRoot::Env => {
                if opts.skip_env_check {
                    continue;
                }
                let key = reference.path.first().map(String::as_str).unwrap_or("");
                if std::env::var(key).is_err() {
                    diags.push(Diagnostic::error(
                        "E302",
                        format!("env variable '{key}' is not set"),
                        Some(node.id.clone()),
                    ));
                }
            }
            RefRoot::Config => {
                let dotted = reference.path.join(".");
                let value = opts.config.and_then(|c| c.try_resolve(&dotted));
                if value.is_none() {
                    diags.push(Diagnostic::error(
                        "E303",
                        format!("config key not found '{dotted}'"),
                        Some(node.id.clone()),
                    ));
                }
            }
            RefRoot::Node(src) => {
                if reference.path.is_empty() {
                    continue;
                }
                let Some(surface) = surfaces.get(src) else {
                    diags.push(Diagnostic::error(
                        "E305",
                        format!("reference to unknown node '{src}'"),
                        Some(node.id.clone()),
                    ));
                    continue;
                };
                let first = &reference.path[0];
                if !surface.contains(first) {
                    diags.push(Diagnostic::error(
                        "E306",
                        format!("reference to unknown alias '{first}' from node '{src}'"),
                        Some(node.id.clone()),
                    ));
                }
            }
        }
    }

    // Statically resolvable config bindings are type-checked against the
    // spec's declared input type.
    if let Some(block_id) = &node.block {
        if let (Ok(spec), Some(config)) = (registry.resolve_spec(block_id, None), opts.config) {
            for (key, value) in &node.inputs {
                let Some(text) = value.as_str() else { continue };
                let Some(inner) = text
                    .trim()
                    .strip_prefix("${config.")
                    .and_then(|rest| rest.strip_suffix('}'))
                else {
                    continue;
                };
                let Some(resolved) = config.try_resolve(inner) else {
                    continue;
                };
                let Some(expected) = spec.inputs.get(key).and_then(|f| f.field_type) else {
                    continue;
                };
                if !expected.matches(&resolved) {
                    diags.push(
                        Diagnostic::error(
                            "E304",
                            format!(
                                "input '{key}' type mismatch for config value (expected {expected:?})"
                            ),
                            Some(node.id.clone()),
                        )
                        .with_field(format!("in.{key}")),
                    );
                }
            }
        }
    }
}

fn vars_path_exists(vars: &serde_json::Map<String, Value>, path: &[String]) -> bool {
    let Some(first) = path.first() else {
        return false;
    };
    let Some(mut current) = vars.get(first) else {
        return false;
    };
    for seg in &path[1..] {
        current = match current {
            Value::Object(map) => match map.get(seg) {
                Some(v) => v,
                None => return false,
            },
            Value::Array(items) => match seg.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return false,
            },
            _ => return false,
        };
    }
    true
}

fn check_guards(node: &Node, diags: &mut Vec<Diagnostic>) {
    if let Some(guard) = &node.when {
        if let Err(e) = evaluator::check_guard_syntax(guard) {
            diags.push(Diagnostic::error(
                "E310",
                format!("invalid when guard: {e}"),
                Some(node.id.clone()),
            ));
        }
    }
    if let Some(while_) = &node.while_ {
        if let Err(e) = evaluator::check_guard_syntax(&while_.condition) {
            diags.push(Diagnostic::error(
                "E310",
                format!("invalid while condition: {e}"),
                Some(node.id.clone()),
            ));
        }
    }
}

fn check_loop_preconditions(
    plan: &Plan,
    node: &Node,
    opts: &SemanticOptions<'_>,
    diags: &mut Vec<Diagnostic>,
) {
    if let Some(foreach) = &node.foreach {
        // Only statically decidable inputs are checked here; node references
        // are a runtime concern.
        let statically_iterable = match &foreach.input {
            Value::Array(_) | Value::Object(_) => Some(true),
            Value::String(text) => {
                let trimmed = text.trim();
                let refs = reference::extract_placeholders(text);
                let sole_placeholder = refs.len() == 1
                    && trimmed.starts_with("${")
                    && trimmed.ends_with('}')
                    && trimmed.matches('}').count() == 1;
                if !sole_placeholder {
                    // Embedded placeholders always stringify.
                    Some(false)
                } else {
                    let parsed = Reference::parse(&refs[0]);
                    match parsed.root {
                        RefRoot::Vars => {
                            resolve_static_vars(&plan.vars, &parsed.path).map(|v| iterable(&v))
                        }
                        RefRoot::Config => opts
                            .config
                            .and_then(|c| c.try_resolve(&parsed.path.join(".")))
                            .map(|v| iterable(&v)),
                        _ => None,
                    }
                }
            }
            _ => Some(false),
        };
        if statically_iterable == Some(false) {
            diags.push(Diagnostic::error(
                "E311",
                "foreach.input must resolve to an iterable".to_string(),
                Some(node.id.clone()),
            ));
        }
    }

    if let Some(while_) = &node.while_ {
        match while_.max_iterations {
            None => diags.push(Diagnostic::error(
                "E312",
                "while.max_iterations is required".to_string(),
                Some(node.id.clone()),
            )),
            Some(n) if n < 1 => diags.push(Diagnostic::error(
                "E312",
                "while.max_iterations must be >= 1".to_string(),
                Some(node.id.clone()),
            )),
            _ => {}
        }
    }
}

fn resolve_static_vars(vars: &serde_json::Map<String, Value>, path: &[String]) -> Option<Value> {
    let mut current = vars.get(path.first()?)?;
    for seg in &path[1..] {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn iterable(value: &Value) -> bool {
    value.is_array() || value.is_object()
}

fn check_subflow(node: &Node, opts: &SemanticOptions<'_>, diags: &mut Vec<Diagnostic>) {
    if !node.is_subflow() {
        return;
    }
    let Some(call) = &node.call else {
        return;
    };
    let Some(lookup) = opts.plan_lookup else {
        return;
    };
    let child = match lookup.find_plan(&call.plan_id) {
        Ok(child) => child,
        Err(_) => {
            diags.push(Diagnostic::error(
                "E320",
                format!("subflow plan not found: {}", call.plan_id),
                Some(node.id.clone()),
            ));
            return;
        }
    };

    // The child's output surface is the union of its own exports and every
    // alias its nodes produce.
    let mut child_surface: HashSet<String> =
        child.exports.iter().map(|e| e.alias.clone()).collect();
    for child_node in &child.graph {
        child_surface.extend(child_node.produced_aliases());
    }
    if let Some(exports) = node.export_list() {
        for export in exports {
            if !child_surface.contains(&export.from) {
                diags.push(Diagnostic::error(
                    "E321",
                    format!(
                        "export '{}' not produced by child plan '{}'",
                        export.from, call.plan_id
                    ),
                    Some(node.id.clone()),
                ));
            }
        }
    }

    // Inputs become the child's vars overrides; flag keys the child never
    // mentions.
    let referenced_vars = child_vars_usage(&child);
    for key in call.inputs.keys() {
        if !child.vars.contains_key(key) && !referenced_vars.contains(key) {
            diags.push(Diagnostic::warning(
                "W322",
                format!(
                    "subflow input '{key}' is not declared or referenced by child plan '{}'",
                    call.plan_id
                ),
                Some(node.id.clone()),
            ));
        }
    }
}

fn child_vars_usage(plan: &Plan) -> HashSet<String> {
    let mut used = HashSet::new();
    for node in &plan.graph {
        for reference in all_placeholders(node) {
            if reference.root == RefRoot::Vars {
                if let Some(first) = reference.path.first() {
                    used.insert(first.clone());
                }
            }
        }
    }
    used
}

fn check_ui_layout(plan: &Plan, diags: &mut Vec<Diagnostic>) {
    let Some(ui) = &plan.ui else {
        return;
    };
    let node_ids: HashSet<&str> = plan.graph.iter().map(|n| n.id.as_str()).collect();
    for entry in &ui.layout {
        if !node_ids.contains(entry.as_str()) {
            diags.push(Diagnostic::error(
                "E330",
                format!("ui layout references unknown node id: {entry}"),
                None,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};

    fn semantic_diags(yaml: &str) -> Vec<Diagnostic> {
        let plan = parse_plan(yaml, PlanFormat::Yaml).unwrap();
        let opts = SemanticOptions {
            skip_env_check: false,
            ..Default::default()
        };
        validate(&plan, &BlockRegistry::with_builtins(), &opts)
    }

    fn codes(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_undefined_var_reference() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
vars: { known: { inner: 1 } }
graph:
  - id: a
    block: test.constant
    in: { value: "${vars.known.inner}" }
    out: { value: v }
  - id: b
    block: test.constant
    in: { value: "${vars.missing}" }
    out: { value: w }
  - id: c
    block: test.constant
    in: { value: "${vars.known.nope}" }
    out: { value: u }
"#,
        );
        assert_eq!(codes(&found), vec!["E301", "E301"]);
    }

    #[test]
    fn test_env_missing() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: "${env.BLOCKFLOW_SURELY_NOT_SET}" }
    out: { value: v }
"#,
        );
        assert!(codes(&found).contains(&"E302"));
    }

    #[test]
    fn test_unknown_node_and_alias() {
        let found = semantic_diags(
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
    in: { x: "${ghost.v}" }
    out: { y: r }
  - id: c
    block: test.double
    in: { x: "${a.wrong_alias}" }
    out: { y: s }
"#,
        );
        let codes = codes(&found);
        assert!(codes.contains(&"E305"));
        assert!(codes.contains(&"E306"));
    }

    #[test]
    fn test_guard_syntax() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 1 }
    when: { expr: "${vars.x} ** 2" }
    out: { value: v }
"#,
        );
        assert!(codes(&found).contains(&"E310"));
    }

    #[test]
    fn test_foreach_iterability() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
vars: { scalar: 3, list: [1, 2] }
graph:
  - id: bad
    type: loop
    foreach: { input: "${vars.scalar}" }
    out: { collect: xs }
    body: { plan: { graph: [] } }
  - id: good
    type: loop
    foreach: { input: "${vars.list}" }
    out: { collect: ys }
    body: { plan: { graph: [] } }
  - id: literal_bad
    type: loop
    foreach: { input: 42 }
    out: { collect: zs }
    body: { plan: { graph: [] } }
"#,
        );
        assert_eq!(
            codes(&found)
                .iter()
                .filter(|c| **c == "E311")
                .count(),
            2
        );
    }

    #[test]
    fn test_while_bounds() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
graph:
  - id: w1
    type: loop
    while: { condition: { expr: "1 < 2" } }
    body: { plan: { graph: [] } }
  - id: w2
    type: loop
    while: { condition: { expr: "1 < 2" }, max_iterations: 0 }
    body: { plan: { graph: [] } }
"#,
        );
        assert_eq!(
            codes(&found)
                .iter()
                .filter(|c| **c == "E312")
                .count(),
            2
        );
    }

    #[test]
    fn test_ui_layout_unknown_node() {
        let found = semantic_diags(
            r#"
id: p
version: "0.1.0"
ui: { layout: [a, phantom] }
graph:
  - id: a
    block: test.constant
    in: { value: 1 }
    out: { value: v }
"#,
        );
        assert!(codes(&found).contains(&"E330"));
    }

    #[test]
    fn test_subflow_lookup_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("child.yaml"),
            r#"
id: child
version: "0.1.0"
vars: { seed: 0 }
graph:
  - id: a
    block: test.constant
    in: { value: "${vars.seed}" }
    out: { value: total }
"#,
        )
        .unwrap();
        let lookup = crate::dsl::parser::DirPlanLookup::new(dir.path());

        let plan = parse_plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: sub
    type: subflow
    call: { plan_id: child, inputs: { seed: 1, extra: 2 } }
    out: { exports: [ { from: total, as: sum }, { from: missing, as: oops } ] }
  - id: lost
    type: subflow
    call: { plan_id: nonexistent, inputs: {} }
    out: { exports: [] }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();

        let opts = SemanticOptions {
            plan_lookup: Some(&lookup),
            ..Default::default()
        };
        let found = validate(&plan, &BlockRegistry::with_builtins(), &opts);
        let codes = codes(&found);
        assert!(codes.contains(&"E320"));
        assert!(codes.contains(&"E321"));
        assert!(codes.contains(&"W322"));
    }
}
