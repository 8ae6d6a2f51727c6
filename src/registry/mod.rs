//! Block registry: spec discovery, version selection, block construction.
//!
//! Specs are YAML/JSON documents found recursively under a directory.
//! Multiple specs may share an id; `get` without a version picks the highest
//! semantic version. Instances are constructed through factories keyed by the
//! spec's `entrypoint`.

pub mod spec;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, warn};

use crate::blocks::builtin::{ConstantBlock, CounterBlock, DoubleBlock, FlakyBlock, SlowBlock};
use crate::blocks::ui::{ConfirmationBlock, InteractiveInputBlock, PlaceholderBlock};
use crate::blocks::{Block, BlockHandle};
use crate::error::RegistryError;

pub use spec::{BlockSpec, DryRunSpec, FieldSpec, FieldType};

type BlockFactory = Arc<dyn Fn() -> BlockHandle + Send + Sync>;

#[derive(Default)]
pub struct BlockRegistry {
    specs_by_id: HashMap<String, Vec<Arc<BlockSpec>>>,
    factories: HashMap<String, BlockFactory>,
}

impl BlockRegistry {
    pub fn empty() -> Self {
        BlockRegistry::default()
    }

    /// Registry pre-populated with the built-in block factories and their
    /// in-memory specs.
    pub fn with_builtins() -> Self {
        let mut registry = BlockRegistry::empty();
        registry.register_factory("builtin:test.constant", || {
            BlockHandle::Processing(Arc::new(ConstantBlock))
        });
        registry.register_factory("builtin:test.double", || {
            BlockHandle::Processing(Arc::new(DoubleBlock))
        });
        registry.register_factory("builtin:test.counter", || {
            BlockHandle::Processing(Arc::new(CounterBlock))
        });
        registry.register_factory("builtin:mock.flaky", || {
            BlockHandle::Processing(Arc::new(FlakyBlock::new()))
        });
        registry.register_factory("builtin:mock.slow", || {
            BlockHandle::Processing(Arc::new(SlowBlock))
        });
        registry.register_factory("builtin:ui.interactive_input", || {
            BlockHandle::Ui(Arc::new(InteractiveInputBlock))
        });
        registry.register_factory("builtin:ui.confirmation", || {
            BlockHandle::Ui(Arc::new(ConfirmationBlock))
        });
        registry.register_factory("builtin:ui.placeholder", || {
            BlockHandle::Ui(Arc::new(PlaceholderBlock))
        });

        for spec in builtin_specs() {
            // Builtin specs are well-formed by construction.
            let _ = registry.register_spec(spec);
        }
        registry
    }

    /// Register a construction factory for an entrypoint locator.
    pub fn register_factory(
        &mut self,
        entrypoint: &str,
        factory: impl Fn() -> BlockHandle + Send + Sync + 'static,
    ) {
        self.factories
            .insert(entrypoint.to_string(), Arc::new(factory));
    }

    /// Register an in-memory spec. Rejects duplicate `id@version`.
    pub fn register_spec(&mut self, spec: BlockSpec) -> Result<(), RegistryError> {
        let versions = self.specs_by_id.entry(spec.id.clone()).or_default();
        if versions.iter().any(|s| s.version == spec.version) {
            return Err(RegistryError::DuplicateVersion {
                id: spec.id,
                version: spec.version,
            });
        }
        versions.push(Arc::new(spec));
        Ok(())
    }

    /// Recursively load every `.yaml`/`.yml`/`.json` spec document under
    /// `dir`. Returns the number of specs loaded.
    pub fn load_specs(&mut self, dir: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(0);
        }
        let mut paths = Vec::new();
        collect_spec_paths(dir, &mut paths)?;
        paths.sort();
        let mut count = 0;
        for path in paths {
            let spec = parse_spec_file(&path)?;
            for missing in spec.missing_env_requirements() {
                warn!(block = %spec.id, env = %missing, "declared requirement not satisfied");
            }
            self.register_spec(spec)?;
            count += 1;
        }
        debug!(count, dir = %dir.display(), "block specs loaded");
        Ok(count)
    }

    /// All `(id, version, spec)` triples, sorted by id then version.
    pub fn list(&self) -> Vec<(String, String, Arc<BlockSpec>)> {
        let mut entries: Vec<(String, String, Arc<BlockSpec>)> = self
            .specs_by_id
            .values()
            .flatten()
            .map(|spec| (spec.id.clone(), spec.version.clone(), spec.clone()))
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }

    pub fn contains(&self, block_id: &str) -> bool {
        let (id, _) = split_versioned_id(block_id);
        self.specs_by_id.contains_key(id)
    }

    /// Latest spec for an id, honoring `id@version` pinning.
    pub fn resolve_spec(
        &self,
        block_id: &str,
        version: Option<&str>,
    ) -> Result<Arc<BlockSpec>, RegistryError> {
        let (id, pinned) = split_versioned_id(block_id);
        let version = version.or(pinned);
        let specs = self
            .specs_by_id
            .get(id)
            .ok_or_else(|| RegistryError::BlockNotFound(id.to_string()))?;
        if let Some(version) = version {
            return specs
                .iter()
                .find(|s| s.version == version)
                .cloned()
                .ok_or_else(|| RegistryError::VersionNotFound {
                    id: id.to_string(),
                    version: version.to_string(),
                });
        }
        pick_latest(specs).ok_or_else(|| RegistryError::BlockNotFound(id.to_string()))
    }

    /// Construct a block instance for an id (and optional version).
    pub fn get(&self, block_id: &str, version: Option<&str>) -> Result<Block, RegistryError> {
        let spec = self.resolve_spec(block_id, version)?;
        let factory = self
            .factories
            .get(&spec.entrypoint)
            .ok_or_else(|| RegistryError::EntrypointNotRegistered(spec.entrypoint.clone()))?;
        Ok(Block {
            spec: spec.clone(),
            handle: factory(),
        })
    }
}

fn collect_spec_paths(
    dir: &Path,
    paths: &mut Vec<std::path::PathBuf>,
) -> Result<(), RegistryError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RegistryError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| RegistryError::Io(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_spec_paths(&path, paths)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        ) {
            paths.push(path);
        }
    }
    Ok(())
}

fn parse_spec_file(path: &Path) -> Result<BlockSpec, RegistryError> {
    let parse_err = |message: String| RegistryError::SpecParse {
        path: path.display().to_string(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
    let spec: BlockSpec = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_saphyr::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
    };
    if spec.id.is_empty() || spec.version.is_empty() || spec.entrypoint.is_empty() {
        return Err(parse_err(
            "spec requires non-empty id, version, and entrypoint".into(),
        ));
    }
    Ok(spec)
}

fn split_versioned_id(block_id: &str) -> (&str, Option<&str>) {
    match block_id.split_once('@') {
        Some((id, version)) => (id, Some(version)),
        None => (block_id, None),
    }
}

fn pick_latest(specs: &[Arc<BlockSpec>]) -> Option<Arc<BlockSpec>> {
    let mut best: Option<(&Arc<BlockSpec>, Option<Version>)> = None;
    for spec in specs {
        let parsed = Version::parse(&spec.version).ok();
        best = match best {
            None => Some((spec, parsed)),
            Some((cur, cur_ver)) => {
                let newer = match (&parsed, &cur_ver) {
                    (Some(a), Some(b)) => a > b,
                    // Unparseable versions lose to parseable ones.
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => spec.version > cur.version,
                };
                if newer {
                    Some((spec, parsed))
                } else {
                    Some((cur, cur_ver))
                }
            }
        };
    }
    best.map(|(spec, _)| spec.clone())
}

fn builtin_specs() -> Vec<BlockSpec> {
    fn field(field_type: FieldType, required: bool) -> FieldSpec {
        FieldSpec {
            field_type: Some(field_type),
            required: Some(required),
            ..Default::default()
        }
    }

    fn spec(
        id: &str,
        inputs: Vec<(&str, FieldSpec)>,
        outputs: Vec<(&str, FieldSpec)>,
    ) -> BlockSpec {
        BlockSpec {
            id: id.to_string(),
            version: "0.1.0".to_string(),
            entrypoint: format!("builtin:{id}"),
            inputs: inputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            outputs: outputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            requirements: Vec::new(),
            description: None,
            tags: None,
            category: None,
            dry_run: None,
        }
    }

    vec![
        spec(
            "test.constant",
            vec![("value", FieldSpec::default())],
            vec![("value", FieldSpec::default())],
        ),
        spec(
            "test.double",
            vec![("x", field(FieldType::Number, true))],
            vec![("y", field(FieldType::Number, false))],
        ),
        spec(
            "test.counter",
            vec![("counter", field(FieldType::String, false))],
            vec![("n", field(FieldType::Integer, false))],
        ),
        spec(
            "mock.flaky",
            vec![("fail_times", field(FieldType::Integer, false))],
            vec![
                ("ok", field(FieldType::Boolean, false)),
                ("attempts", field(FieldType::Integer, false)),
            ],
        ),
        spec(
            "mock.slow",
            vec![("delay_ms", field(FieldType::Integer, false))],
            vec![("ok", field(FieldType::Boolean, false))],
        ),
        spec(
            "ui.interactive_input",
            vec![
                ("mode", FieldSpec {
                    field_type: Some(FieldType::String),
                    enum_values: Some(vec![
                        serde_json::json!("collect"),
                        serde_json::json!("confirm"),
                    ]),
                    ..Default::default()
                }),
                ("message", field(FieldType::String, false)),
                ("requirements", field(FieldType::Array, false)),
            ],
            vec![("collected", field(FieldType::Object, false))],
        ),
        spec(
            "ui.confirmation",
            vec![("message", field(FieldType::String, false))],
            vec![
                ("approved", field(FieldType::Boolean, false)),
                ("metadata", field(FieldType::Object, false)),
            ],
        ),
        spec(
            "ui.placeholder",
            vec![("value", FieldSpec::default())],
            vec![("value", FieldSpec::default())],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolvable() {
        let registry = BlockRegistry::with_builtins();
        let block = registry.get("test.constant", None).unwrap();
        assert!(!block.is_ui());
        let block = registry.get("ui.interactive_input", None).unwrap();
        assert!(block.is_ui());
        assert!(registry.contains("mock.flaky"));
    }

    #[test]
    fn test_version_selection() {
        let mut registry = BlockRegistry::with_builtins();
        let mut v2 = registry.resolve_spec("test.double", None).unwrap().as_ref().clone();
        v2.version = "0.2.0".into();
        registry.register_spec(v2).unwrap();
        let mut v10 = registry.resolve_spec("test.double", None).unwrap().as_ref().clone();
        v10.version = "0.10.0".into();
        registry.register_spec(v10).unwrap();

        // Semantic, not lexicographic: 0.10.0 > 0.2.0.
        let spec = registry.resolve_spec("test.double", None).unwrap();
        assert_eq!(spec.version, "0.10.0");

        let spec = registry.resolve_spec("test.double", Some("0.2.0")).unwrap();
        assert_eq!(spec.version, "0.2.0");

        // id@version pinning
        let spec = registry.resolve_spec("test.double@0.1.0", None).unwrap();
        assert_eq!(spec.version, "0.1.0");

        let err = registry.resolve_spec("test.double", Some("9.9.9")).unwrap_err();
        assert!(matches!(err, RegistryError::VersionNotFound { .. }));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut registry = BlockRegistry::with_builtins();
        let dup = registry.resolve_spec("test.double", None).unwrap().as_ref().clone();
        let err = registry.register_spec(dup).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateVersion { .. }));
    }

    #[test]
    fn test_unknown_block_and_entrypoint() {
        let mut registry = BlockRegistry::with_builtins();
        assert!(matches!(
            registry.get("no.such.block", None),
            Err(RegistryError::BlockNotFound(_))
        ));

        registry
            .register_spec(BlockSpec {
                id: "custom.widget".into(),
                version: "1.0.0".into(),
                entrypoint: "native:widget".into(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                requirements: Vec::new(),
                description: None,
                tags: None,
                category: None,
                dry_run: None,
            })
            .unwrap();
        assert!(matches!(
            registry.get("custom.widget", None),
            Err(RegistryError::EntrypointNotRegistered(_))
        ));
    }

    #[test]
    fn test_load_specs_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("excel");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("read.yaml"),
            r#"
id: excel.read_data
version: "1.0.0"
entrypoint: builtin:test.constant
inputs:
  path: { type: string, required: true }
outputs:
  rows: { type: array }
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("notify.json"),
            r#"{"id": "notify.send", "version": "0.1.0", "entrypoint": "builtin:test.constant"}"#,
        )
        .unwrap();

        let mut registry = BlockRegistry::empty();
        registry.register_factory("builtin:test.constant", || {
            BlockHandle::Processing(Arc::new(ConstantBlock))
        });
        let count = registry.load_specs(dir.path()).unwrap();
        assert_eq!(count, 2);
        assert!(registry.get("excel.read_data", None).is_ok());
        assert!(registry.get("notify.send", None).is_ok());
    }

    #[test]
    fn test_load_specs_rejects_broken_spec() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "id: only_an_id\n").unwrap();
        let mut registry = BlockRegistry::empty();
        let err = registry.load_specs(dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::SpecParse { .. }));
    }

    #[test]
    fn test_list_sorted() {
        let registry = BlockRegistry::with_builtins();
        let entries = registry.list();
        assert!(entries.len() >= 8);
        let ids: Vec<&str> = entries.iter().map(|(id, _, _)| id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_missing_specs_dir_is_zero() {
        let mut registry = BlockRegistry::empty();
        assert_eq!(registry.load_specs("/no/such/dir").unwrap(), 0);
    }
}
