//! Layered static validation.
//!
//! Layer 1 checks document structure and registry binding, layer 2 the graph
//! topology, layer 3 reference resolvability and control-flow preconditions.
//! All layers run and their findings are aggregated; validation failures are
//! never silently recovered.

pub mod layer1_structure;
pub mod layer2_topology;
pub mod layer3_semantic;
pub mod types;

use crate::config::ConfigStore;
use crate::dsl::parser::PlanLookup;
use crate::dsl::schema::Plan;
use crate::registry::BlockRegistry;

pub use layer3_semantic::SemanticOptions;
pub use types::{Diagnostic, DiagnosticLevel, ValidationReport};

/// Validator configuration. Defaults check env keys and skip config/subflow
/// resolution (no store or lookup attached).
#[derive(Default)]
pub struct ValidateOptions<'a> {
    pub config: Option<&'a ConfigStore>,
    pub plan_lookup: Option<&'a dyn PlanLookup>,
    pub skip_env_check: bool,
}

/// Run every validation layer and aggregate the findings.
pub fn validate_plan(
    plan: &Plan,
    registry: &BlockRegistry,
    opts: &ValidateOptions<'_>,
) -> ValidationReport {
    let mut diagnostics = layer1_structure::validate(plan, registry);
    diagnostics.extend(layer2_topology::validate(plan));
    let semantic_opts = SemanticOptions {
        config: opts.config,
        plan_lookup: opts.plan_lookup,
        skip_env_check: opts.skip_env_check,
    };
    diagnostics.extend(layer3_semantic::validate(plan, registry, &semantic_opts));
    ValidationReport::from_diagnostics(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_plan, PlanFormat};

    #[test]
    fn test_all_layers_aggregate() {
        let plan = parse_plan(
            r#"
id: broken
version: "0.1.0"
ui: { layout: [phantom] }
graph:
  - id: a
    block: no.such.block
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
        // structure, topology, and semantic findings all present
        assert!(codes.contains(&"E101"));
        assert!(codes.contains(&"E120"));
        assert!(codes.contains(&"E201"));
        assert!(codes.contains(&"E330"));
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = parse_plan(
            r#"
id: ok
version: "0.1.0"
vars: { items: [1, 2, 3] }
graph:
  - id: a
    block: test.constant
    in: { value: "${vars.items}" }
    out: { value: v }
  - id: b
    block: test.double
    in: { x: 2 }
    when: { expr: "${a.v} != null" }
    out: { y: r }
"#,
            PlanFormat::Yaml,
        )
        .unwrap();
        let report = validate_plan(
            &plan,
            &BlockRegistry::with_builtins(),
            &ValidateOptions::default(),
        );
        assert!(report.is_valid, "{report}");
    }
}
