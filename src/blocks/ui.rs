//! Built-in UI blocks.
//!
//! In headless mode every UI block answers from the execution context's mock
//! responses instead of suspending. Otherwise a block either consumes the
//! previously collected submission or requests suspension.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::ExecutionContext;
use crate::error::BlockError;

use super::{BlockContext, UiBlock, UiOutcome};

fn as_output_map(value: Value, default_key: &str) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut out = Map::new();
            out.insert(default_key.to_string(), other);
            out
        }
    }
}

/// Collects structured user input. Outputs `{collected: {...}}`.
pub struct InteractiveInputBlock;

impl InteractiveInputBlock {
    pub const ID: &'static str = "ui.interactive_input";
}

#[async_trait]
impl UiBlock for InteractiveInputBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("collected".into(), Value::Object(Map::new()));
        Ok(out)
    }

    async fn render(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
        exec: &ExecutionContext,
        submission: Option<Value>,
    ) -> Result<UiOutcome, BlockError> {
        if exec.headless {
            let mock = exec
                .mock_response(Self::ID, &ctx.node_id)
                .unwrap_or(Value::Object(Map::new()));
            let outputs = match &mock {
                Value::Object(map) if map.contains_key("collected") => map.clone(),
                other => {
                    let mut out = Map::new();
                    out.insert("collected".into(), other.clone());
                    out
                }
            };
            return Ok(UiOutcome::Outputs(outputs));
        }
        if let Some(submission) = submission {
            return Ok(UiOutcome::Outputs(as_output_map(submission, "collected")));
        }
        Ok(UiOutcome::AwaitInput {
            snapshot: Some(inputs),
        })
    }
}

/// Approval gate. Outputs `{approved: bool, metadata: {...}}`.
pub struct ConfirmationBlock;

impl ConfirmationBlock {
    pub const ID: &'static str = "ui.confirmation";
}

#[async_trait]
impl UiBlock for ConfirmationBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("approved".into(), Value::Bool(false));
        out.insert("metadata".into(), Value::Object(Map::new()));
        Ok(out)
    }

    async fn render(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
        exec: &ExecutionContext,
        submission: Option<Value>,
    ) -> Result<UiOutcome, BlockError> {
        if exec.headless {
            let outputs = match exec.mock_response(Self::ID, &ctx.node_id) {
                Some(mock) => as_output_map(mock, "approved"),
                None => {
                    // Unattended approval defaults to accept.
                    let mut out = Map::new();
                    out.insert("approved".into(), Value::Bool(true));
                    out.insert("metadata".into(), Value::Object(Map::new()));
                    out
                }
            };
            return Ok(UiOutcome::Outputs(outputs));
        }
        if let Some(submission) = submission {
            return Ok(UiOutcome::Outputs(as_output_map(submission, "approved")));
        }
        Ok(UiOutcome::AwaitInput {
            snapshot: Some(inputs),
        })
    }
}

/// Non-suspending display block: passes its `value` input through. Useful as
/// a layout anchor and in loop bodies.
pub struct PlaceholderBlock;

#[async_trait]
impl UiBlock for PlaceholderBlock {
    fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert(
            "value".into(),
            inputs.get("value").cloned().unwrap_or(Value::Null),
        );
        Ok(out)
    }

    async fn render(
        &self,
        _ctx: &BlockContext,
        inputs: Map<String, Value>,
        _exec: &ExecutionContext,
        _submission: Option<Value>,
    ) -> Result<UiOutcome, BlockError> {
        let mut out = Map::new();
        out.insert(
            "value".into(),
            inputs.get("value").cloned().unwrap_or(Value::Null),
        );
        Ok(UiOutcome::Outputs(out))
    }
}
