//! Plan parser: converts raw YAML/JSON/TOML text into [`Plan`].
//!
//! `${...}` references are intentionally left untouched here; the validator
//! and runner interpret them later.

use std::path::Path;

use super::schema::Plan;
use crate::error::PlanError;

/// Supported plan document formats.
#[derive(Debug, Clone, Copy)]
pub enum PlanFormat {
    /// YAML format (`.yaml` / `.yml`).
    Yaml,
    /// JSON format (`.json`).
    Json,
    /// TOML format (`.toml`).
    Toml,
}

impl PlanFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(PlanFormat::Yaml),
            Some("json") => Some(PlanFormat::Json),
            Some("toml") => Some(PlanFormat::Toml),
            _ => None,
        }
    }
}

/// Parse plan content into a [`Plan`].
pub fn parse_plan(content: &str, format: PlanFormat) -> Result<Plan, PlanError> {
    match format {
        PlanFormat::Yaml => {
            serde_saphyr::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))
        }
        PlanFormat::Json => {
            serde_json::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))
        }
        PlanFormat::Toml => {
            // Parse TOML → toml::Value, convert to serde_json::Value, then
            // deserialize. The two-step conversion keeps fields typed as
            // serde_json::Value (inputs, guards) intact.
            let toml_val: toml::Value =
                toml::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
            let json_val = toml_value_to_json(toml_val);
            serde_json::from_value(json_val).map_err(|e| PlanError::Parse(e.to_string()))
        }
    }
}

/// Load a plan from disk, selecting the format by file extension.
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan, PlanError> {
    let path = path.as_ref();
    let format = PlanFormat::from_extension(path)
        .ok_or_else(|| PlanError::Parse(format!("unsupported plan file extension: {:?}", path)))?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| PlanError::Parse(format!("{}: {}", path.display(), e)))?;
    parse_plan(&content, format)
}

/// Host-defined lookup used to locate child plans referenced by subflow
/// nodes.
pub trait PlanLookup: Send + Sync {
    fn find_plan(&self, plan_id: &str) -> Result<Plan, PlanError>;
}

/// Default lookup: `plan_id` is either a direct file path or a document named
/// `<plan_id>.yaml` under a designs directory.
#[derive(Debug, Clone)]
pub struct DirPlanLookup {
    designs_dir: std::path::PathBuf,
}

impl DirPlanLookup {
    pub fn new(designs_dir: impl Into<std::path::PathBuf>) -> Self {
        DirPlanLookup {
            designs_dir: designs_dir.into(),
        }
    }
}

impl Default for DirPlanLookup {
    fn default() -> Self {
        DirPlanLookup::new("designs")
    }
}

impl PlanLookup for DirPlanLookup {
    fn find_plan(&self, plan_id: &str) -> Result<Plan, PlanError> {
        let direct = std::path::Path::new(plan_id);
        let path = if direct.extension().is_some() {
            direct.to_path_buf()
        } else {
            self.designs_dir.join(format!("{plan_id}.yaml"))
        };
        if !path.exists() {
            return Err(PlanError::SubflowNotFound(plan_id.to_string()));
        }
        load_plan(&path)
    }
}

/// Convert a [`toml::Value`] into a [`serde_json::Value`].
///
/// TOML has no null type, so `Datetime` values are stringified.
fn toml_value_to_json(val: toml::Value) -> serde_json::Value {
    match val {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(tbl) => {
            let map: serde_json::Map<String, serde_json::Value> = tbl
                .into_iter()
                .map(|(k, v)| (k, toml_value_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
api_version: v1
id: two_nodes
version: "0.1.0"
vars:
  threshold: 10
graph:
  - id: a
    block: test.constant
    in: { value: 7 }
    out: { value: v }
  - id: b
    block: test.double
    in: { x: "${a.v}" }
    out: { y: r }
"#;
        let plan = parse_plan(yaml, PlanFormat::Yaml).unwrap();
        assert_eq!(plan.id, "two_nodes");
        assert_eq!(plan.graph.len(), 2);
        assert_eq!(plan.graph[1].inputs.get("x").unwrap(), "${a.v}");
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"id":"p","version":"0.1.0","graph":[{"id":"a","block":"test.constant"}]}"#;
        let plan = parse_plan(json, PlanFormat::Json).unwrap();
        assert_eq!(plan.graph.len(), 1);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
id = "p"
version = "0.1.0"

[[graph]]
id = "a"
block = "test.constant"
[graph.in]
value = 7
"#;
        let plan = parse_plan(toml_str, PlanFormat::Toml).unwrap();
        assert_eq!(plan.graph[0].inputs.get("value").unwrap(), 7);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_plan("{{{nope", PlanFormat::Json).is_err());
        assert!(parse_plan("[[[bad", PlanFormat::Toml).is_err());
    }

    #[test]
    fn test_parse_yaml_loop_node() {
        let yaml = r#"
id: with_loop
version: "0.1.0"
vars:
  items: [1, 2, 3]
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
"#;
        let plan = parse_plan(yaml, PlanFormat::Yaml).unwrap();
        let node = &plan.graph[0];
        assert!(node.is_loop());
        let body = node.body.as_ref().unwrap();
        assert_eq!(body.plan.exports[0].alias, "doubled");
    }

    #[test]
    fn test_load_plan_unknown_extension() {
        let err = load_plan("plan.ini").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_load_plan_roundtrip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, r#"{"id":"disk","version":"1.0.0","graph":[]}"#).unwrap();
        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.id, "disk");
    }
}
