//! Layered configuration store backing `${config.*}` references.
//!
//! Files under the config directory are loaded lazily on first resolution.
//! Each file contributes a namespace named after its stem, so
//! `task_configs.yaml` answers `${config.task_configs.*}`.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Default)]
pub struct ConfigStore {
    config_dir: PathBuf,
    data: RwLock<Option<serde_json::Map<String, Value>>>,
}

impl ConfigStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        ConfigStore {
            config_dir: config_dir.into(),
            data: RwLock::new(None),
        }
    }

    /// An empty store; every resolution fails with `ConfigKeyMissing`.
    pub fn empty() -> Self {
        ConfigStore::new(PathBuf::new())
    }

    fn ensure_loaded(&self) {
        if self.data.read().is_some() {
            return;
        }
        let mut guard = self.data.write();
        if guard.is_some() {
            return;
        }
        *guard = Some(self.load_all());
    }

    fn load_all(&self) -> serde_json::Map<String, Value> {
        let mut by_namespace = serde_json::Map::new();
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(_) => return by_namespace,
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            match Self::parse_file(&path) {
                Ok(Some(Value::Object(map))) => {
                    let ns = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    by_namespace.insert(ns, Value::Object(map));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable config file");
                }
            }
        }
        by_namespace
    }

    fn parse_file(path: &Path) -> Result<Option<Value>, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let load_err = |e: String| ConfigError::Load {
            path: path.display().to_string(),
            message: e,
        };
        let content = match ext.as_str() {
            "yaml" | "yml" | "json" => {
                std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?
            }
            _ => return Ok(None),
        };
        let value = match ext.as_str() {
            "yaml" | "yml" => {
                serde_saphyr::from_str(&content).map_err(|e| load_err(e.to_string()))?
            }
            _ => serde_json::from_str(&content).map_err(|e| load_err(e.to_string()))?,
        };
        Ok(Some(value))
    }

    /// Resolve `namespace.path.to.key` from the loaded configuration.
    pub fn resolve(&self, dotted_path: &str) -> Result<Value, ConfigError> {
        self.try_resolve(dotted_path)
            .ok_or_else(|| ConfigError::KeyMissing(dotted_path.to_string()))
    }

    /// Like [`resolve`](Self::resolve) but returns `None` on a miss.
    pub fn try_resolve(&self, dotted_path: &str) -> Option<Value> {
        if dotted_path.is_empty() {
            return None;
        }
        self.ensure_loaded();
        let guard = self.data.read();
        let data = guard.as_ref()?;
        let mut parts = dotted_path.split('.');
        let ns = parts.next()?;
        let mut current = data.get(ns)?;
        for seg in parts {
            current = current.as_object()?.get(seg)?;
        }
        Some(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_resolve_yaml_namespace() {
        let (_dir, store) = store_with(&[("task_configs.yaml", "batch:\n  size: 50\n")]);
        assert_eq!(
            store.resolve("task_configs.batch.size").unwrap(),
            serde_json::json!(50)
        );
    }

    #[test]
    fn test_resolve_json_namespace() {
        let (_dir, store) = store_with(&[("limits.json", r#"{"retries": 3}"#)]);
        assert_eq!(store.resolve("limits.retries").unwrap(), serde_json::json!(3));
    }

    #[test]
    fn test_missing_key() {
        let (_dir, store) = store_with(&[("a.yaml", "x: 1\n")]);
        let err = store.resolve("a.missing").unwrap_err();
        assert!(matches!(err, ConfigError::KeyMissing(_)));
        assert!(store.try_resolve("nope.at.all").is_none());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let store = ConfigStore::new("/definitely/not/a/dir");
        assert!(store.try_resolve("anything").is_none());
    }

    #[test]
    fn test_broken_file_skipped() {
        let (_dir, store) = store_with(&[("ok.json", r#"{"k": true}"#), ("bad.json", "{{{")]);
        assert_eq!(store.resolve("ok.k").unwrap(), serde_json::json!(true));
        assert!(store.try_resolve("bad.k").is_none());
    }
}
