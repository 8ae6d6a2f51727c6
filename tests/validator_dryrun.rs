mod common;

use common::plan;
use serde_json::json;

use blockflow::{
    dry_run_plan, validate_plan, BlockRegistry, DryRunOptions, PlanError, ValidateOptions,
};

#[test]
fn validator_reports_all_findings_at_once() {
    let plan = plan(
        r#"
id: many_problems
version: "0.1.0"
vars: { known: 1 }
ui: { layout: [ghost_ui] }
graph:
  - id: n1
    block: does.not.exist
  - id: n1
    block: test.double
    in: { x: "${vars.unknown}", bogus: 1 }
    out: { y: r }
  - id: n2
    block: test.double
    in: { x: "${n3.y}" }
    when: { expr: "${n3.y} + 1" }
    out: { y: a }
  - id: n3
    block: test.double
    in: { x: "${n2.a}" }
    out: { y: y }
  - id: w
    type: loop
    while: { condition: { expr: "1 < 2" } }
    body: { plan: { graph: [] } }
"#,
    );
    let report = validate_plan(
        &plan,
        &BlockRegistry::with_builtins(),
        &ValidateOptions::default(),
    );
    assert!(!report.is_valid);

    let codes: Vec<&str> = report
        .diagnostics
        .iter()
        .map(|d| d.code.as_str())
        .collect();
    // duplicate id, unknown block, undefined input key, cycle, undefined
    // var, unsafe guard, missing max_iterations, unknown ui layout node
    for expected in ["E101", "E120", "E121", "E201", "E301", "E310", "E312", "E330"] {
        assert!(codes.contains(&expected), "missing {expected} in {codes:?}");
    }

    // The host surface carries one message per error.
    assert_eq!(report.messages().len(), report.errors().len());
}

#[test]
fn validation_failure_blocks_dry_run() {
    let plan = plan(
        r#"
id: invalid
version: "0.1.0"
graph:
  - id: a
    block: test.double
    in: { x: "${missing.v}" }
    out: { y: r }
"#,
    );
    let err = dry_run_plan(
        &plan,
        &BlockRegistry::with_builtins(),
        &DryRunOptions::default(),
    )
    .unwrap_err();
    let PlanError::ValidationFailed(report) = err else {
        panic!("expected validation failure");
    };
    assert!(!report.is_valid);
}

#[test]
fn dry_run_wires_shapes_through_the_graph() {
    let plan = plan(
        r#"
id: wired
version: "0.1.0"
vars: { items: [10, 20] }
graph:
  - id: src
    block: test.constant
    in: { value: "${vars.items}" }
    out: { value: rows }
  - id: l
    type: loop
    foreach: { input: "${src.rows}", item_var: row }
    out: { collect: processed }
    body:
      plan:
        graph:
          - id: d
            block: test.double
            in: { x: "${vars.row}" }
            out: { y: r }
        exports:
          - { from: r, as: processed }
  - id: sink
    block: test.constant
    in: { value: "${l.processed}" }
    out: { value: final }
"#,
    );
    let registry = BlockRegistry::with_builtins();
    let first = dry_run_plan(&plan, &registry, &DryRunOptions::default()).unwrap();
    assert_eq!(first.outputs["rows"], json!([10, 20]));
    assert!(first.outputs["processed"].is_array());
    assert_eq!(first.outputs["processed"].as_array().unwrap().len(), 1);
    // The sink consumed the loop's synthesized sequence.
    assert_eq!(first.outputs["final"], first.outputs["processed"]);

    // Determinism: identical plan, identical synthesized outputs.
    let second = dry_run_plan(&plan, &registry, &DryRunOptions::default()).unwrap();
    assert_eq!(first.outputs, second.outputs);
}

#[test]
fn resolving_tree_without_placeholders_is_identity() {
    let vars = serde_json::Map::new();
    let scope = blockflow::reference::Scope::new(&vars);
    let tree = json!({
        "nested": {"list": [1, 2, {"deep": true}]},
        "text": "no placeholders here",
        "n": 3.25
    });
    let resolved = blockflow::reference::resolve_value(&tree, &scope).unwrap();
    assert_eq!(resolved, tree);
}
