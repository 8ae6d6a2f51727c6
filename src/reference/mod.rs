//! Placeholder reference resolution.
//!
//! A placeholder is `${root(.path)*}` where `root` is one of `vars`, `env`,
//! `config`, or a node id. A placeholder that is the sole content of a string
//! resolves to its native value; one embedded in surrounding text is
//! stringified in place. Resolution walks value trees of arbitrary depth and
//! never mutates its input.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::ConfigStore;
use crate::error::ErrorCode;

static SOLE_PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\$\{([^}]+)\}\s*$").unwrap());
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefRoot {
    Vars,
    Env,
    Config,
    Node(String),
}

/// A parsed `${...}` reference.
#[derive(Debug, Clone)]
pub struct Reference {
    pub raw: String,
    pub root: RefRoot,
    /// Path segments after the root (for nodes: alias followed by drill-down).
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(inner: &str) -> Reference {
        let inner = inner.trim();
        let mut parts = inner.split('.');
        let head = parts.next().unwrap_or_default().to_string();
        let path: Vec<String> = parts.map(|s| s.to_string()).collect();
        let root = match head.as_str() {
            "vars" => RefRoot::Vars,
            "env" => RefRoot::Env,
            "config" => RefRoot::Config,
            _ => RefRoot::Node(head),
        };
        Reference {
            raw: inner.to_string(),
            root,
            path,
        }
    }
}

/// Failure modes of reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The reference can never resolve in the current scope.
    Unresolved { reference: String, code: ErrorCode },
    /// The referenced node exists but has not produced outputs yet; the
    /// scheduler treats this as a deferral signal.
    Pending { node_id: String, reference: String },
    /// The referenced node completed without outputs (skipped or failed).
    DependencyUnavailable { node_id: String, reference: String },
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ResolveError::Unresolved { code, .. } => *code,
            ResolveError::Pending { .. } => ErrorCode::UnresolvedReference,
            ResolveError::DependencyUnavailable { .. } => ErrorCode::DependencyFailed,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ResolveError::Unresolved { reference, .. }
            | ResolveError::Pending { reference, .. }
            | ResolveError::DependencyUnavailable { reference, .. } => reference,
        }
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Unresolved { reference, code } => {
                write!(f, "[{code}] unresolved reference '${{{reference}}}'")
            }
            ResolveError::Pending { reference, .. } => {
                write!(f, "reference '${{{reference}}}' is not resolvable yet")
            }
            ResolveError::DependencyUnavailable { node_id, reference } => {
                write!(
                    f,
                    "reference '${{{reference}}}' points at node '{node_id}' which produced no outputs"
                )
            }
        }
    }
}

/// Access to node outputs for reference resolution. Implemented by the run
/// context; validation and dry-run provide synthetic implementations.
pub trait NodeScope: Send + Sync {
    /// Local outputs of a node whose execution has completed successfully.
    fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>>;
    /// Translate a downstream-visible alias into the node's local output key.
    fn local_key_for_alias(&self, node_id: &str, alias: &str) -> Option<String>;
    /// Whether the node id exists in the enclosing graph.
    fn is_known_node(&self, node_id: &str) -> bool;
    /// Whether the node finished without outputs (guard skip or failure).
    fn is_unavailable(&self, node_id: &str) -> bool {
        let _ = node_id;
        false
    }
}

/// The scope a value tree is resolved against.
pub struct Scope<'a> {
    pub vars: &'a Map<String, Value>,
    pub config: Option<&'a ConfigStore>,
    pub nodes: Option<&'a dyn NodeScope>,
}

impl<'a> Scope<'a> {
    pub fn new(vars: &'a Map<String, Value>) -> Self {
        Scope {
            vars,
            config: None,
            nodes: None,
        }
    }

    pub fn with_config(mut self, config: &'a ConfigStore) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_nodes(mut self, nodes: &'a dyn NodeScope) -> Self {
        self.nodes = Some(nodes);
        self
    }
}

/// Resolve a single parsed reference to its value.
pub fn resolve_reference(reference: &Reference, scope: &Scope<'_>) -> Result<Value, ResolveError> {
    match &reference.root {
        RefRoot::Vars => {
            let Some(first) = reference.path.first() else {
                return Err(unresolved(reference, ErrorCode::UnresolvedReference));
            };
            let base = scope
                .vars
                .get(first)
                .ok_or_else(|| unresolved(reference, ErrorCode::UnresolvedReference))?;
            traverse(base, &reference.path[1..])
                .ok_or_else(|| unresolved(reference, ErrorCode::UnresolvedReference))
        }
        RefRoot::Env => {
            let Some(key) = reference.path.first() else {
                return Err(unresolved(reference, ErrorCode::EnvKeyMissing));
            };
            std::env::var(key)
                .map(Value::String)
                .map_err(|_| unresolved(reference, ErrorCode::EnvKeyMissing))
        }
        RefRoot::Config => {
            let dotted = reference.path.join(".");
            scope
                .config
                .and_then(|c| c.try_resolve(&dotted))
                .ok_or_else(|| unresolved(reference, ErrorCode::ConfigKeyMissing))
        }
        RefRoot::Node(node_id) => resolve_node_reference(reference, node_id, scope),
    }
}

fn resolve_node_reference(
    reference: &Reference,
    node_id: &str,
    scope: &Scope<'_>,
) -> Result<Value, ResolveError> {
    let nodes = scope
        .nodes
        .ok_or_else(|| unresolved(reference, ErrorCode::UnresolvedReference))?;
    if !nodes.is_known_node(node_id) {
        return Err(unresolved(reference, ErrorCode::UnresolvedReference));
    }
    let Some(outputs) = nodes.node_outputs(node_id) else {
        if nodes.is_unavailable(node_id) {
            return Err(ResolveError::DependencyUnavailable {
                node_id: node_id.to_string(),
                reference: reference.raw.clone(),
            });
        }
        return Err(ResolveError::Pending {
            node_id: node_id.to_string(),
            reference: reference.raw.clone(),
        });
    };
    let Some(first) = reference.path.first() else {
        return Err(unresolved(reference, ErrorCode::UnresolvedReference));
    };
    // A reference names either the local output key or the declared alias.
    let base = outputs.get(first).cloned().or_else(|| {
        nodes
            .local_key_for_alias(node_id, first)
            .and_then(|local| outputs.get(&local).cloned())
    });
    let base = base.ok_or_else(|| unresolved(reference, ErrorCode::UnresolvedReference))?;
    traverse(&base, &reference.path[1..])
        .ok_or_else(|| unresolved(reference, ErrorCode::UnresolvedReference))
}

fn unresolved(reference: &Reference, code: ErrorCode) -> ResolveError {
    ResolveError::Unresolved {
        reference: reference.raw.clone(),
        code,
    }
}

/// Walk `path` into `value`. Map keys match case-sensitively first, then fall
/// back to a case-insensitive match to tolerate serialization variance.
/// Integer segments index into arrays.
fn traverse(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value.clone();
    for seg in path {
        current = match current {
            Value::Object(ref map) => match map.get(seg) {
                Some(v) => v.clone(),
                None => {
                    let lowered = seg.to_lowercase();
                    map.iter()
                        .find(|(k, _)| k.to_lowercase() == lowered)
                        .map(|(_, v)| v.clone())?
                }
            },
            Value::Array(ref arr) => {
                let idx: usize = seg.parse().ok()?;
                arr.get(idx).cloned()?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve every placeholder in a value tree against `scope`, returning a new
/// tree of the same shape.
pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Result<Value, ResolveError> {
    match value {
        Value::String(text) => resolve_string(text, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, scope: &Scope<'_>) -> Result<Value, ResolveError> {
    if let Some(caps) = SOLE_PLACEHOLDER_RE.captures(text) {
        let reference = Reference::parse(&caps[1]);
        return resolve_reference(&reference, scope);
    }
    if !text.contains("${") {
        return Ok(Value::String(text.to_string()));
    }
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        result.push_str(&text[last..whole.start()]);
        let reference = Reference::parse(&caps[1]);
        let value = resolve_reference(&reference, scope)?;
        result.push_str(&stringify(&value));
        last = whole.end();
    }
    result.push_str(&text[last..]);
    Ok(Value::String(result))
}

/// Render a value for embedding into surrounding text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Inner texts of every placeholder found in `text`, in order.
pub fn extract_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Collect `(node_id, reference)` pairs for every node-rooted placeholder in a
/// value tree. `vars`/`env`/`config` references are excluded.
pub fn collect_node_refs(value: &Value, acc: &mut Vec<(String, Reference)>) {
    match value {
        Value::String(text) => {
            for inner in extract_placeholders(text) {
                let reference = Reference::parse(&inner);
                if let RefRoot::Node(node_id) = &reference.root {
                    // Bare identifiers without a path are plain strings, not
                    // references.
                    if !reference.path.is_empty() {
                        acc.push((node_id.clone(), reference));
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_node_refs(item, acc);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_node_refs(v, acc);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeNodes {
        outputs: HashMap<String, Map<String, Value>>,
        aliases: HashMap<String, Vec<(String, String)>>,
        known: Vec<String>,
        unavailable: Vec<String>,
    }

    impl FakeNodes {
        fn new() -> Self {
            FakeNodes {
                outputs: HashMap::new(),
                aliases: HashMap::new(),
                known: Vec::new(),
                unavailable: Vec::new(),
            }
        }

        fn with_node(mut self, id: &str, outputs: Value) -> Self {
            self.known.push(id.to_string());
            self.outputs
                .insert(id.to_string(), outputs.as_object().unwrap().clone());
            self
        }

        fn with_alias(mut self, id: &str, local: &str, alias: &str) -> Self {
            self.aliases
                .entry(id.to_string())
                .or_default()
                .push((local.to_string(), alias.to_string()));
            self
        }
    }

    impl NodeScope for FakeNodes {
        fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>> {
            self.outputs.get(node_id).cloned()
        }

        fn local_key_for_alias(&self, node_id: &str, alias: &str) -> Option<String> {
            self.aliases.get(node_id).and_then(|pairs| {
                pairs
                    .iter()
                    .find(|(_, a)| a == alias)
                    .map(|(local, _)| local.clone())
            })
        }

        fn is_known_node(&self, node_id: &str) -> bool {
            self.known.iter().any(|id| id == node_id)
        }

        fn is_unavailable(&self, node_id: &str) -> bool {
            self.unavailable.iter().any(|id| id == node_id)
        }
    }

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_sole_placeholder_keeps_native_type() {
        let vars = vars(json!({"count": 7, "flag": true, "obj": {"a": 1}}));
        let scope = Scope::new(&vars);
        assert_eq!(
            resolve_value(&json!("${vars.count}"), &scope).unwrap(),
            json!(7)
        );
        assert_eq!(
            resolve_value(&json!("${vars.flag}"), &scope).unwrap(),
            json!(true)
        );
        assert_eq!(
            resolve_value(&json!("${vars.obj}"), &scope).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_embedded_placeholder_stringifies() {
        let vars = vars(json!({"n": 3, "who": "ops"}));
        let scope = Scope::new(&vars);
        assert_eq!(
            resolve_value(&json!("run ${vars.n} for ${vars.who}"), &scope).unwrap(),
            json!("run 3 for ops")
        );
    }

    #[test]
    fn test_no_placeholder_is_identity() {
        let vars = vars(json!({}));
        let scope = Scope::new(&vars);
        let tree = json!({"a": [1, "two", {"b": null}], "c": 4.5});
        assert_eq!(resolve_value(&tree, &scope).unwrap(), tree);
    }

    #[test]
    fn test_node_alias_resolution() {
        let nodes = FakeNodes::new()
            .with_node("a", json!({"value": 7}))
            .with_alias("a", "value", "v");
        let vars = vars(json!({}));
        let scope = Scope::new(&vars).with_nodes(&nodes);
        // local key
        assert_eq!(
            resolve_value(&json!("${a.value}"), &scope).unwrap(),
            json!(7)
        );
        // declared alias
        assert_eq!(resolve_value(&json!("${a.v}"), &scope).unwrap(), json!(7));
    }

    #[test]
    fn test_nested_path_and_index() {
        let nodes = FakeNodes::new().with_node(
            "q",
            json!({"rows": [{"Name": "alice"}, {"Name": "bob"}]}),
        );
        let vars = vars(json!({}));
        let scope = Scope::new(&vars).with_nodes(&nodes);
        assert_eq!(
            resolve_value(&json!("${q.rows.1.Name}"), &scope).unwrap(),
            json!("bob")
        );
        // case-insensitive fallback
        assert_eq!(
            resolve_value(&json!("${q.rows.0.name}"), &scope).unwrap(),
            json!("alice")
        );
    }

    #[test]
    fn test_pending_vs_unresolved() {
        let mut nodes = FakeNodes::new();
        nodes.known.push("later".to_string());
        let vars = vars(json!({}));
        let scope = Scope::new(&vars).with_nodes(&nodes);

        let err = resolve_value(&json!("${later.x}"), &scope).unwrap_err();
        assert!(matches!(err, ResolveError::Pending { .. }));

        let err = resolve_value(&json!("${ghost.x}"), &scope).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Unresolved {
                code: ErrorCode::UnresolvedReference,
                ..
            }
        ));
    }

    #[test]
    fn test_dependency_unavailable() {
        let mut nodes = FakeNodes::new();
        nodes.known.push("skipped".to_string());
        nodes.unavailable.push("skipped".to_string());
        let vars = vars(json!({}));
        let scope = Scope::new(&vars).with_nodes(&nodes);
        let err = resolve_value(&json!("${skipped.x}"), &scope).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DependencyFailed);
    }

    #[test]
    fn test_env_resolution() {
        std::env::set_var("BLOCKFLOW_TEST_REF_ENV", "hello");
        let vars = vars(json!({}));
        let scope = Scope::new(&vars);
        assert_eq!(
            resolve_value(&json!("${env.BLOCKFLOW_TEST_REF_ENV}"), &scope).unwrap(),
            json!("hello")
        );
        let err = resolve_value(&json!("${env.BLOCKFLOW_NO_SUCH_VAR}"), &scope).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvKeyMissing);
    }

    #[test]
    fn test_config_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.yaml"), "thresholds:\n  upper: 90\n").unwrap();
        let store = ConfigStore::new(dir.path());
        let vars = vars(json!({}));
        let scope = Scope::new(&vars).with_config(&store);
        assert_eq!(
            resolve_value(&json!("${config.app.thresholds.upper}"), &scope).unwrap(),
            json!(90)
        );
        let err = resolve_value(&json!("${config.app.thresholds.nope}"), &scope).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigKeyMissing);
    }

    #[test]
    fn test_collect_node_refs() {
        let tree = json!({
            "a": "${upstream.v}",
            "b": ["${vars.x}", "prefix ${other.alias.deep} suffix"],
            "c": "${no_path}"
        });
        let mut refs = Vec::new();
        collect_node_refs(&tree, &mut refs);
        let mut ids: Vec<&str> = refs.iter().map(|(id, _)| id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["other", "upstream"]);
    }

    #[test]
    fn test_extract_placeholders() {
        let found = extract_placeholders("x ${a.b} y ${vars.k}");
        assert_eq!(found, vec!["a.b".to_string(), "vars.k".to_string()]);
    }
}
