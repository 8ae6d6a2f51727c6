//! On-disk run state: the authoritative record for resuming a suspended run.
//!
//! Snapshots live at `runs/<plan_id>/<run_id>.state.json` and are written
//! atomically (write-to-temp-then-rename). Byte-valued outputs are base64
//! encoded on the way out and restored bit-exact on the way in.

use std::path::PathBuf;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::StateError;

/// Marker object used to persist byte arrays inside JSON.
const BYTES_MARKER: &str = "b64bytes";

/// The pending UI record written when a run suspends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingUi {
    pub node_id: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub submitted: bool,
    /// Submission stored directly on the pending record; an alternative to
    /// writing `ui_outputs[node_id]` before resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub ts: String,
}

/// Everything needed to reconstruct an execution context after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStateSnapshot {
    #[serde(default)]
    pub ui_outputs: Map<String, Value>,
    #[serde(default)]
    pub pending_ui: Option<PendingUi>,
    #[serde(default)]
    pub success_nodes: Vec<String>,
    #[serde(default)]
    pub vars_overrides: Map<String, Value>,
}

/// File-backed store for run state snapshots.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    runs_dir: PathBuf,
}

impl RunStateStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        RunStateStore {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn state_path(&self, plan_id: &str, run_id: &str) -> PathBuf {
        self.runs_dir
            .join(plan_id)
            .join(format!("{run_id}.state.json"))
    }

    pub fn save(
        &self,
        plan_id: &str,
        run_id: &str,
        snapshot: &RunStateSnapshot,
    ) -> Result<(), StateError> {
        let path = self.state_path(plan_id, run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Storage(e.to_string()))?;
        }
        let value =
            serde_json::to_value(snapshot).map_err(|e| StateError::Serialization(e.to_string()))?;
        let encoded = encode_bytes(&value);
        let body = serde_json::to_vec_pretty(&encoded)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| StateError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StateError::Storage(e.to_string()))?;
        debug!(plan_id, run_id, path = %path.display(), "run state saved");
        Ok(())
    }

    pub fn load(
        &self,
        plan_id: &str,
        run_id: &str,
    ) -> Result<Option<RunStateSnapshot>, StateError> {
        let path = self.state_path(plan_id, run_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Storage(e.to_string())),
        };
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| StateError::Serialization(e.to_string()))?;
        let decoded = decode_bytes(&value);
        let snapshot = serde_json::from_value(decoded)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn delete(&self, plan_id: &str, run_id: &str) -> Result<(), StateError> {
        let path = self.state_path(plan_id, run_id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Storage(e.to_string())),
        }
    }

    /// The most recent snapshot with an unsubmitted pending UI record.
    /// `prefer_run_id` wins when it holds one; otherwise the newest state file
    /// is selected by modification time.
    pub fn find_latest_pending_ui(
        &self,
        plan_id: &str,
        prefer_run_id: Option<&str>,
    ) -> Option<(PendingUi, String)> {
        if let Some(run_id) = prefer_run_id {
            if let Ok(Some(snapshot)) = self.load(plan_id, run_id) {
                if let Some(pending) = snapshot.pending_ui {
                    return Some((pending, run_id.to_string()));
                }
            }
        }

        let dir = self.runs_dir.join(plan_id);
        let entries = std::fs::read_dir(&dir).ok()?;
        let mut candidates: Vec<(std::time::SystemTime, String)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let run_id = name.strip_suffix(".state.json")?.to_string();
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, run_id))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, run_id) in candidates {
            if let Ok(Some(snapshot)) = self.load(plan_id, &run_id) {
                if let Some(pending) = snapshot.pending_ui {
                    return Some((pending, run_id));
                }
            }
        }
        None
    }

    /// Remove every state file recorded for a plan.
    pub fn clear_state_files(&self, plan_id: &str) -> Result<(), StateError> {
        let dir = self.runs_dir.join(plan_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StateError::Storage(e.to_string())),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".state.json") {
                std::fs::remove_file(entry.path())
                    .map_err(|e| StateError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Replace byte arrays (arrays of integers 0..=255 under a `bytes` key) with
/// a base64 marker object so they survive JSON persistence.
pub fn encode_bytes(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if k == "bytes" {
                    if let Some(bytes) = as_byte_array(v) {
                        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        out.insert(
                            k.clone(),
                            serde_json::json!({"__type": BYTES_MARKER, "data": data}),
                        );
                        continue;
                    }
                }
                out.insert(k.clone(), encode_bytes(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(encode_bytes).collect()),
        other => other.clone(),
    }
}

/// Inverse of [`encode_bytes`].
pub fn decode_bytes(value: &Value) -> Value {
    if let Value::Object(map) = value {
        if map.get("__type").and_then(|v| v.as_str()) == Some(BYTES_MARKER) {
            if let Some(data) = map.get("data").and_then(|v| v.as_str()) {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) {
                    return Value::Array(
                        bytes.into_iter().map(|b| Value::Number(b.into())).collect(),
                    );
                }
            }
        }
        let mut out = Map::with_capacity(map.len());
        for (k, v) in map {
            out.insert(k.clone(), decode_bytes(v));
        }
        return Value::Object(out);
    }
    if let Value::Array(items) = value {
        return Value::Array(items.iter().map(decode_bytes).collect());
    }
    value.clone()
}

pub(crate) fn as_byte_array(value: &Value) -> Option<Vec<u8>> {
    let arr = value.as_array()?;
    let mut bytes = Vec::with_capacity(arr.len());
    for item in arr {
        let n = item.as_u64()?;
        if n > 255 {
            return None;
        }
        bytes.push(n as u8);
    }
    Some(bytes)
}

/// Write raw bytes from a binary file descriptor, if `value` looks like one.
pub(crate) fn descriptor_bytes(value: &Value) -> Option<(String, Vec<u8>)> {
    let map = value.as_object()?;
    let name = map.get("name")?.as_str()?.to_string();
    if let Some(bytes) = map.get("bytes").and_then(as_byte_array) {
        return Some((name, bytes));
    }
    if let Some(b64) = map.get("base64").and_then(|v| v.as_str()) {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) {
            return Some((name, bytes));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, RunStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join("runs"));
        (dir, store)
    }

    fn sample_snapshot() -> RunStateSnapshot {
        let mut ui_outputs = Map::new();
        ui_outputs.insert("u1".into(), json!({"collected": {"x": 42}}));
        RunStateSnapshot {
            ui_outputs,
            pending_ui: Some(PendingUi {
                node_id: "u2".into(),
                inputs: json!({"message": "approve?"}).as_object().unwrap().clone(),
                submitted: false,
                outputs: None,
                ts: "2024-01-01T00:00:00Z".into(),
            }),
            success_nodes: vec!["a".into()],
            vars_overrides: Map::new(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let snapshot = sample_snapshot();
        store.save("plan_a", "run_1", &snapshot).unwrap();
        let loaded = store.load("plan_a", "run_1").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.load("plan_a", "nope").unwrap().is_none());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let (_dir, store) = store();
        let mut ui_outputs = Map::new();
        ui_outputs.insert(
            "upload".into(),
            json!({"file": {"name": "a.bin", "bytes": [0, 127, 255]}}),
        );
        let snapshot = RunStateSnapshot {
            ui_outputs,
            ..Default::default()
        };
        store.save("p", "r", &snapshot).unwrap();

        // Persisted form is base64, not a raw array.
        let raw = std::fs::read_to_string(store.state_path("p", "r")).unwrap();
        assert!(raw.contains("b64bytes"));
        assert!(raw.contains("AH//"));

        let loaded = store.load("p", "r").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_find_latest_pending_ui() {
        let (_dir, store) = store();
        store
            .save("p", "old", &RunStateSnapshot::default())
            .unwrap();
        store.save("p", "mid", &sample_snapshot()).unwrap();
        let (pending, run_id) = store.find_latest_pending_ui("p", None).unwrap();
        assert_eq!(pending.node_id, "u2");
        assert_eq!(run_id, "mid");
    }

    #[test]
    fn test_find_latest_prefers_run_id() {
        let (_dir, store) = store();
        store.save("p", "a", &sample_snapshot()).unwrap();
        store.save("p", "b", &sample_snapshot()).unwrap();
        let (_, run_id) = store.find_latest_pending_ui("p", Some("a")).unwrap();
        assert_eq!(run_id, "a");
    }

    #[test]
    fn test_clear_state_files() {
        let (_dir, store) = store();
        store.save("p", "a", &sample_snapshot()).unwrap();
        store.save("p", "b", &sample_snapshot()).unwrap();
        store.clear_state_files("p").unwrap();
        assert!(store.find_latest_pending_ui("p", None).is_none());
    }

    #[test]
    fn test_descriptor_bytes() {
        let (name, bytes) =
            descriptor_bytes(&json!({"name": "x.bin", "bytes": [1, 2, 3]})).unwrap();
        assert_eq!(name, "x.bin");
        assert_eq!(bytes, vec![1, 2, 3]);

        let (_, bytes) = descriptor_bytes(&json!({"name": "y.bin", "base64": "AQID"})).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        assert!(descriptor_bytes(&json!({"name": "z"})).is_none());
        assert!(descriptor_bytes(&json!({"bytes": [1]})).is_none());
    }
}
