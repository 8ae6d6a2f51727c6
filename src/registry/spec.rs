//! Declarative block descriptors loaded from disk.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Value kinds a spec field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Bytes,
}

impl FieldType {
    /// Minimal representative value used by the dry-run engine when no sample
    /// is declared.
    pub fn sample_value(&self) -> Value {
        match self {
            FieldType::String => Value::String("sample".into()),
            FieldType::Number => serde_json::json!(0.0),
            FieldType::Integer => serde_json::json!(0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Array => Value::Array(Vec::new()),
            FieldType::Object => Value::Object(serde_json::Map::new()),
            FieldType::Bytes => serde_json::json!({"name": "sample.bin", "base64": ""}),
        }
    }

    /// Shape check used at validation time and at node boundaries.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Bytes => match value {
                Value::Object(map) => map.contains_key("bytes") || map.contains_key("base64"),
                Value::Array(items) => items.iter().all(|v| v.as_u64().is_some_and(|n| n <= 255)),
                _ => false,
            },
        }
    }
}

/// Schema of a single input or output field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl FieldSpec {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }
}

/// Example outputs usable during dry-run instead of synthesized samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunSpec {
    #[serde(default)]
    pub samples: BTreeMap<String, Value>,
}

/// Declarative descriptor of a block. Specs are read-only once loaded; the
/// registry owns their lifecycle for the duration of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub id: String,
    pub version: String,
    /// Opaque locator consumed by the host to construct the block.
    pub entrypoint: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FieldSpec>,
    /// Dependency keys for pre-flight checks; `env:NAME` entries name
    /// required environment variables.
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<DryRunSpec>,
}

impl BlockSpec {
    /// `env:` requirements whose variable is not currently set.
    pub fn missing_env_requirements(&self) -> Vec<String> {
        self.requirements
            .iter()
            .filter_map(|req| req.strip_prefix("env:"))
            .filter(|name| std::env::var(name).is_err())
            .map(|name| name.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_samples() {
        assert_eq!(FieldType::String.sample_value(), json!("sample"));
        assert_eq!(FieldType::Integer.sample_value(), json!(0));
        assert_eq!(FieldType::Array.sample_value(), json!([]));
    }

    #[test]
    fn test_field_type_matching() {
        assert!(FieldType::Integer.matches(&json!(3)));
        assert!(!FieldType::Integer.matches(&json!(3.5)));
        assert!(FieldType::Number.matches(&json!(3.5)));
        assert!(!FieldType::Boolean.matches(&json!(0)));
        assert!(FieldType::Bytes.matches(&json!({"name": "a", "bytes": [1]})));
        assert!(FieldType::Bytes.matches(&json!([1, 255])));
        assert!(!FieldType::Bytes.matches(&json!([1, 300])));
    }

    #[test]
    fn test_spec_parse_yaml_shape() {
        let spec: BlockSpec = serde_json::from_value(json!({
            "id": "excel.read_data",
            "version": "1.2.0",
            "entrypoint": "builtin:excel.read_data",
            "inputs": {
                "path": {"type": "string", "required": true},
                "mode": {"type": "string", "enum": ["strict", "lenient"]}
            },
            "outputs": {
                "rows": {"type": "array"}
            },
            "requirements": ["env:EXCEL_LICENSE"],
            "dry_run": {"samples": {"rows": [[1, 2]]}}
        }))
        .unwrap();
        assert!(spec.inputs["path"].is_required());
        assert_eq!(
            spec.inputs["mode"].enum_values.as_ref().unwrap().len(),
            2
        );
        assert_eq!(spec.dry_run.unwrap().samples["rows"], json!([[1, 2]]));
    }

    #[test]
    fn test_missing_env_requirements() {
        let spec = BlockSpec {
            id: "x".into(),
            version: "0.1.0".into(),
            entrypoint: "builtin:x".into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            requirements: vec![
                "env:BLOCKFLOW_DEFINITELY_UNSET_VAR".into(),
                "some_library".into(),
            ],
            description: None,
            tags: None,
            category: None,
            dry_run: None,
        };
        assert_eq!(
            spec.missing_env_requirements(),
            vec!["BLOCKFLOW_DEFINITELY_UNSET_VAR".to_string()]
        );
    }
}
