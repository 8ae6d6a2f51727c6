//! Mutable per-run state.
//!
//! The context is owned by a run and mutated only by the runner; blocks see
//! immutable input snapshots. `outputs` and `ui_outputs` are kept separate so
//! UI submissions survive suspension while processing outputs are recomputed
//! on resume.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::state::{PendingUi, RunStateSnapshot};

#[derive(Debug, Default)]
pub struct ExecutionContext {
    outputs: RwLock<std::collections::HashMap<String, Map<String, Value>>>,
    ui_outputs: RwLock<Map<String, Value>>,
    pending_ui: RwLock<Option<PendingUi>>,
    pub vars_overrides: Map<String, Value>,
    /// When set, UI blocks auto-respond from `ui_mock_responses` and runs
    /// never suspend.
    pub headless: bool,
    /// Workspace root exposed to blocks through their context.
    pub workspace: Option<PathBuf>,
    /// Mock UI responses keyed by node id first, block id second.
    pub ui_mock_responses: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(vars_overrides: Map<String, Value>) -> Self {
        ExecutionContext {
            vars_overrides,
            ..Default::default()
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_mock_responses(mut self, responses: Map<String, Value>) -> Self {
        self.ui_mock_responses = responses;
        self
    }

    /// Restore UI state from a persisted snapshot when resuming.
    pub fn restore(&self, snapshot: &RunStateSnapshot) {
        *self.ui_outputs.write() = snapshot.ui_outputs.clone();
        *self.pending_ui.write() = snapshot.pending_ui.clone();
    }

    /// Assemble the persistable snapshot for this context.
    pub fn snapshot(&self, success_nodes: Vec<String>) -> RunStateSnapshot {
        RunStateSnapshot {
            ui_outputs: self.ui_outputs.read().clone(),
            pending_ui: self.pending_ui.read().clone(),
            success_nodes,
            vars_overrides: self.vars_overrides.clone(),
        }
    }

    pub fn record_outputs(&self, node_id: &str, outputs: Map<String, Value>) {
        self.outputs.write().insert(node_id.to_string(), outputs);
    }

    pub fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.outputs.read().get(node_id).cloned()
    }

    pub fn has_outputs(&self, node_id: &str) -> bool {
        self.outputs.read().contains_key(node_id)
    }

    pub fn set_ui_output(&self, node_id: &str, value: Value) {
        self.ui_outputs.write().insert(node_id.to_string(), value);
    }

    pub fn ui_output(&self, node_id: &str) -> Option<Value> {
        self.ui_outputs.read().get(node_id).cloned()
    }

    pub fn pending_ui(&self) -> Option<PendingUi> {
        self.pending_ui.read().clone()
    }

    pub fn set_pending_ui(&self, pending: Option<PendingUi>) {
        *self.pending_ui.write() = pending;
    }

    /// Mock response for a UI node: node id takes precedence over block id.
    pub fn mock_response(&self, block_id: &str, node_id: &str) -> Option<Value> {
        if let Some(value) = self.ui_mock_responses.get(node_id) {
            return Some(value.clone());
        }
        self.ui_mock_responses.get(block_id).cloned()
    }

    /// Child context for a loop iteration: same headless/mock settings, a
    /// child cancellation token, and the given variable overrides.
    pub fn child(&self, vars_overrides: Map<String, Value>) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            outputs: RwLock::new(std::collections::HashMap::new()),
            ui_outputs: RwLock::new(Map::new()),
            pending_ui: RwLock::new(None),
            vars_overrides,
            headless: self.headless,
            workspace: self.workspace.clone(),
            ui_mock_responses: self.ui_mock_responses.clone(),
            cancel: self.cancel.child_token(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outputs_recording() {
        let ctx = ExecutionContext::new();
        assert!(!ctx.has_outputs("a"));
        ctx.record_outputs("a", json!({"v": 1}).as_object().unwrap().clone());
        assert!(ctx.has_outputs("a"));
        assert_eq!(ctx.node_outputs("a").unwrap()["v"], 1);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let ctx = ExecutionContext::new();
        ctx.set_ui_output("u", json!({"collected": {"x": 42}}));
        ctx.set_pending_ui(Some(PendingUi {
            node_id: "u2".into(),
            inputs: Map::new(),
            submitted: false,
            outputs: None,
            ts: "t".into(),
        }));
        let snapshot = ctx.snapshot(vec!["a".into()]);

        let restored = ExecutionContext::new();
        restored.restore(&snapshot);
        assert_eq!(restored.ui_output("u").unwrap()["collected"]["x"], 42);
        assert_eq!(restored.pending_ui().unwrap().node_id, "u2");
        assert_eq!(snapshot.success_nodes, vec!["a".to_string()]);
    }

    #[test]
    fn test_mock_response_precedence() {
        let mut mocks = Map::new();
        mocks.insert("node_1".into(), json!({"x": 1}));
        mocks.insert("ui.confirmation".into(), json!({"approved": true}));
        let ctx = ExecutionContext::new().with_mock_responses(mocks);

        assert_eq!(ctx.mock_response("ui.confirmation", "node_1").unwrap()["x"], 1);
        assert_eq!(
            ctx.mock_response("ui.confirmation", "other").unwrap()["approved"],
            true
        );
        assert!(ctx.mock_response("ui.unknown", "missing").is_none());
    }

    #[test]
    fn test_child_inherits_headless_and_cancel() {
        let mut parent = ExecutionContext::new();
        parent.headless = true;
        let child = parent.child(Map::new());
        assert!(child.headless);
        parent.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }
}
