//! Dry-run engine: detect type and wiring errors without external effects.
//!
//! Walks the plan in topological order synthesizing outputs per block spec
//! (preferring declared `dry_run.samples`, then the block's own dry-run
//! shape, then a minimal value per declared type) and propagates them through
//! references exactly as the runner would. Block `run`/`render` is never
//! invoked, so re-running on an unchanged plan yields identical outputs.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::config::ConfigStore;
use crate::dsl::parser::PlanLookup;
use crate::dsl::schema::{Node, NodeOutputs, Plan};
use crate::dsl::validation::{self, ValidateOptions};
use crate::error::{PlanError, PlanResult};
use crate::graph;
use crate::reference::{self, NodeScope, Scope};
use crate::registry::BlockRegistry;

#[derive(Default)]
pub struct DryRunOptions<'a> {
    pub config: Option<&'a ConfigStore>,
    pub plan_lookup: Option<&'a dyn PlanLookup>,
    pub skip_env_check: bool,
}

/// Synthesized results of a dry run.
#[derive(Debug, Clone, Default)]
pub struct DryRunResult {
    /// Alias-keyed surface, as the runner would return.
    pub outputs: Map<String, Value>,
    /// Per-node synthesized outputs, keyed by local output name.
    pub node_outputs: HashMap<String, Map<String, Value>>,
}

struct SynthScope<'a> {
    plan: &'a Plan,
    produced: &'a HashMap<String, Map<String, Value>>,
}

impl NodeScope for SynthScope<'_> {
    fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.produced.get(node_id).cloned()
    }

    fn local_key_for_alias(&self, node_id: &str, alias: &str) -> Option<String> {
        let node = self.plan.node(node_id)?;
        node.alias_map()?
            .iter()
            .find(|(_, a)| a.as_str() == alias)
            .map(|(local, _)| local.clone())
    }

    fn is_known_node(&self, node_id: &str) -> bool {
        self.plan.node(node_id).is_some()
    }
}

/// Validate, then dry-run the whole plan.
pub fn dry_run_plan(
    plan: &Plan,
    registry: &BlockRegistry,
    opts: &DryRunOptions<'_>,
) -> PlanResult<DryRunResult> {
    let report = validation::validate_plan(
        plan,
        registry,
        &ValidateOptions {
            config: opts.config,
            plan_lookup: opts.plan_lookup,
            skip_env_check: opts.skip_env_check,
        },
    );
    if !report.is_valid {
        return Err(PlanError::ValidationFailed(Box::new(report)));
    }
    dry_run_graph(plan, registry, opts, &plan.vars)
}

fn dry_run_graph(
    plan: &Plan,
    registry: &BlockRegistry,
    opts: &DryRunOptions<'_>,
    vars: &Map<String, Value>,
) -> PlanResult<DryRunResult> {
    let order = graph::build_dependency_graph(plan).topo_order()?;
    let mut produced: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut surface = Map::new();

    for node_id in order {
        let Some(node) = plan.node(&node_id) else {
            continue;
        };
        let outputs = if node.is_loop() {
            synthesize_loop(plan, node, registry, opts, vars, &produced)?
        } else if node.is_subflow() {
            synthesize_subflow(node, registry, opts)?
        } else {
            synthesize_block(plan, node, registry, opts, vars, &produced)?
        };

        match &node.outputs {
            Some(NodeOutputs::Aliases(aliases)) => {
                for (local, alias) in aliases {
                    if let Some(value) = outputs.get(local) {
                        surface.insert(alias.clone(), value.clone());
                    }
                }
            }
            Some(NodeOutputs::Exports { exports }) => {
                for export in exports {
                    if let Some(value) = outputs.get(&export.alias) {
                        surface.insert(export.alias.clone(), value.clone());
                    } else if let Some(value) = outputs.get(&export.from) {
                        surface.insert(export.alias.clone(), value.clone());
                    }
                }
            }
            None => {}
        }
        produced.insert(node_id, outputs);
    }

    Ok(DryRunResult {
        outputs: surface,
        node_outputs: produced,
    })
}

fn synthesize_block(
    plan: &Plan,
    node: &Node,
    registry: &BlockRegistry,
    opts: &DryRunOptions<'_>,
    vars: &Map<String, Value>,
    produced: &HashMap<String, Map<String, Value>>,
) -> PlanResult<Map<String, Value>> {
    let Some(block_id) = &node.block else {
        return Ok(Map::new());
    };
    let block = registry.get(block_id, None)?;

    // Inputs are resolved against synthesized upstream outputs so wiring
    // errors surface here, not in production.
    let synth_scope = SynthScope { plan, produced };
    let mut scope = Scope::new(vars).with_nodes(&synth_scope);
    if let Some(config) = opts.config {
        scope = scope.with_config(config);
    }
    let mut inputs = Map::new();
    for (key, value) in &node.inputs {
        let resolved =
            reference::resolve_value(value, &scope).map_err(|e| PlanError::UnresolvedReference {
                node_id: node.id.clone(),
                reference: e.reference().to_string(),
            })?;
        inputs.insert(key.clone(), resolved);
    }

    let samples = block
        .spec
        .dry_run
        .as_ref()
        .map(|d| d.samples.clone())
        .unwrap_or_default();
    let block_shape = block.dry_run(&inputs).unwrap_or_default();

    let mut outputs = Map::new();
    for (local, field) in &block.spec.outputs {
        let value = samples
            .get(local)
            .cloned()
            .or_else(|| block_shape.get(local).cloned())
            .or_else(|| field.field_type.map(|t| t.sample_value()))
            .unwrap_or_else(|| Value::String("sample".into()));
        outputs.insert(local.clone(), value);
    }
    // Blocks may expose outputs beyond the declared schema during dry-run;
    // keep them so downstream references resolve.
    for (key, value) in block_shape {
        outputs.entry(key).or_insert(value);
    }
    Ok(outputs)
}

fn synthesize_loop(
    plan: &Plan,
    node: &Node,
    registry: &BlockRegistry,
    opts: &DryRunOptions<'_>,
    vars: &Map<String, Value>,
    produced: &HashMap<String, Map<String, Value>>,
) -> PlanResult<Map<String, Value>> {
    let Some(body) = &node.body else {
        return Ok(Map::new());
    };

    let mut body_vars = vars.clone();
    if let Some(foreach) = &node.foreach {
        let synth_scope = SynthScope { plan, produced };
        let mut scope = Scope::new(vars).with_nodes(&synth_scope);
        if let Some(config) = opts.config {
            scope = scope.with_config(config);
        }
        let item_sample = reference::resolve_value(&foreach.input, &scope)
            .ok()
            .and_then(|v| v.as_array().and_then(|a| a.first().cloned()))
            .unwrap_or(Value::Null);
        body_vars.insert(foreach.item_var.clone(), item_sample);
        body_vars.insert(foreach.index_var.clone(), Value::from(0));
    }

    let child = dry_run_graph(&body.plan, registry, opts, &body_vars)?;
    let exported = exported_surface(&body.plan, &child.outputs);

    // The collect alias becomes a one-element sequence of the body's exported
    // shape.
    let collect_alias = node
        .alias_map()
        .and_then(|m| m.get("collect").cloned());
    let element = collect_alias
        .as_ref()
        .and_then(|alias| exported.get(alias).cloned())
        .unwrap_or_else(|| Value::Object(exported.clone()));

    let mut outputs = Map::new();
    outputs.insert("collect".into(), Value::Array(vec![element]));
    Ok(outputs)
}

fn synthesize_subflow(
    node: &Node,
    registry: &BlockRegistry,
    opts: &DryRunOptions<'_>,
) -> PlanResult<Map<String, Value>> {
    let Some(call) = &node.call else {
        return Ok(Map::new());
    };
    let Some(lookup) = opts.plan_lookup else {
        return Ok(Map::new());
    };
    let child_plan = lookup.find_plan(&call.plan_id)?;
    let child = dry_run_graph(&child_plan, registry, opts, &child_plan.vars)?;
    let child_surface = exported_surface(&child_plan, &child.outputs);

    let mut outputs = Map::new();
    if let Some(exports) = node.export_list() {
        for export in exports {
            let value = child_surface.get(&export.from).cloned().unwrap_or(Value::Null);
            outputs.insert(export.alias.clone(), value);
        }
    }
    Ok(outputs)
}

fn exported_surface(plan: &Plan, alias_surface: &Map<String, Value>) -> Map<String, Value> {
    plan.exported_surface(alias_surface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};
    use serde_json::json;

    fn dry_run(yaml: &str) -> PlanResult<DryRunResult> {
        let plan = parse_plan(yaml, PlanFormat::Yaml).unwrap();
        dry_run_plan(
            &plan,
            &BlockRegistry::with_builtins(),
            &DryRunOptions::default(),
        )
    }

    #[test]
    fn test_linear_synthesis_and_propagation() {
        let result = dry_run(
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
        )
        .unwrap();
        // test.constant's dry_run echoes its input, so propagation is visible
        assert_eq!(result.outputs["v"], json!(7));
        assert_eq!(result.node_outputs["b"]["y"], json!(0));
    }

    #[test]
    fn test_invalid_plan_rejected() {
        let err = dry_run(
            r#"
id: p
version: "0.1.0"
graph:
  - id: b
    block: test.double
    in: { x: "${ghost.v}" }
    out: { y: r }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::ValidationFailed(_)));
    }

    #[test]
    fn test_loop_collect_is_singleton_sequence() {
        let result = dry_run(
            r#"
id: p
version: "0.1.0"
vars: { items: [3, 4] }
graph:
  - id: l
    type: loop
    foreach: { input: "${vars.items}", item_var: it }
    out: { collect: doubled }
    body:
      plan:
        graph:
          - id: m
            block: test.double
            in: { x: "${vars.it}" }
            out: { y: r }
        exports:
          - { from: r, as: doubled }
"#,
        )
        .unwrap();
        let collected = result.outputs["doubled"].as_array().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0], json!(0));
    }

    #[test]
    fn test_determinism() {
        let yaml = r#"
id: p
version: "0.1.0"
graph:
  - id: a
    block: mock.flaky
    out: { ok: fine }
"#;
        let first = dry_run(yaml).unwrap();
        let second = dry_run(yaml).unwrap();
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(
            serde_json::to_value(&first.node_outputs["a"]).unwrap(),
            serde_json::to_value(&second.node_outputs["a"]).unwrap()
        );
    }

    #[test]
    fn test_samples_preferred() {
        let mut registry = BlockRegistry::with_builtins();
        let mut spec = registry
            .resolve_spec("test.double", None)
            .unwrap()
            .as_ref()
            .clone();
        spec.version = "0.9.0".into();
        spec.dry_run = Some(crate::registry::DryRunSpec {
            samples: [("y".to_string(), json!(42))].into_iter().collect(),
        });
        registry.register_spec(spec).unwrap();

        let plan = parse_plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: b
    block: test.double
    in: { x: 1 }
    out: { y: r }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();
        let result = dry_run_plan(&plan, &registry, &DryRunOptions::default()).unwrap();
        assert_eq!(result.outputs["r"], json!(42));
    }

    #[test]
    fn test_subflow_exports_mapped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("child.yaml"),
            r#"
id: child
version: "0.1.0"
graph:
  - id: a
    block: test.constant
    in: { value: 5 }
    out: { value: total }
"#,
        )
        .unwrap();
        let lookup = crate::dsl::DirPlanLookup::new(dir.path());
        let plan = parse_plan(
            r#"
id: p
version: "0.1.0"
graph:
  - id: sub
    type: subflow
    call: { plan_id: child, inputs: {} }
    out: { exports: [ { from: total, as: sum } ] }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();
        let result = dry_run_plan(
            &plan,
            &BlockRegistry::with_builtins(),
            &DryRunOptions {
                plan_lookup: Some(&lookup),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.outputs["sum"], json!(5));
    }
}
