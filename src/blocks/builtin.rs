//! Built-in processing blocks.
//!
//! `test.*` blocks back the end-to-end scenarios; `mock.flaky` and
//! `mock.slow` exercise retry and timeout policy without external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{BlockError, ErrorCode};

use super::{BlockContext, ProcessingBlock};

/// Emits its `value` input unchanged.
pub struct ConstantBlock;

#[async_trait]
impl ProcessingBlock for ConstantBlock {
    fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert(
            "value".into(),
            inputs.get("value").cloned().unwrap_or(Value::Null),
        );
        Ok(out)
    }

    async fn run(
        &self,
        _ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert(
            "value".into(),
            inputs.get("value").cloned().unwrap_or(Value::Null),
        );
        Ok(out)
    }
}

/// Doubles the numeric input `x` into output `y`.
pub struct DoubleBlock;

#[async_trait]
impl ProcessingBlock for DoubleBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("y".into(), Value::from(0));
        Ok(out)
    }

    async fn run(
        &self,
        _ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError> {
        let x = inputs.get("x").ok_or_else(|| {
            BlockError::new(ErrorCode::InputValidationFailed, "input 'x' is required")
        })?;
        let mut out = Map::new();
        let doubled = if let Some(n) = x.as_i64() {
            Value::from(n * 2)
        } else if let Some(f) = x.as_f64() {
            Value::from(f * 2.0)
        } else {
            return Err(BlockError::new(
                ErrorCode::InputValidationFailed,
                format!("input 'x' must be a number, got {x}"),
            ));
        };
        out.insert("y".into(), doubled);
        Ok(out)
    }
}

// Counters are shared across a run and its loop/subflow children, which all
// share the root run id prefix.
static COUNTERS: LazyLock<Mutex<HashMap<String, i64>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Fetch-then-increment counter. Successive calls within one run (including
/// loop bodies) observe 0, 1, 2, ...
pub struct CounterBlock;

impl CounterBlock {
    fn counter_key(ctx: &BlockContext, inputs: &Map<String, Value>) -> String {
        let scope = ctx.run_id.split('#').next().unwrap_or(&ctx.run_id);
        let name = inputs
            .get("counter")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        format!("{scope}:{name}")
    }
}

#[async_trait]
impl ProcessingBlock for CounterBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("n".into(), Value::from(0));
        Ok(out)
    }

    async fn run(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError> {
        let key = Self::counter_key(ctx, &inputs);
        let mut counters = COUNTERS.lock();
        let entry = counters.entry(key).or_insert(0);
        let current = *entry;
        *entry += 1;
        let mut out = Map::new();
        out.insert("n".into(), Value::from(current));
        Ok(out)
    }
}

/// Fails the first `fail_times` attempts (default 1), then succeeds. State is
/// per block instance, so a retrying node sees consecutive attempts.
pub struct FlakyBlock {
    attempts: AtomicU32,
}

impl FlakyBlock {
    pub fn new() -> Self {
        FlakyBlock {
            attempts: AtomicU32::new(0),
        }
    }
}

impl Default for FlakyBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessingBlock for FlakyBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("ok".into(), Value::Bool(true));
        Ok(out)
    }

    async fn run(
        &self,
        _ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError> {
        let fail_times = inputs
            .get("fail_times")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= fail_times {
            return Err(BlockError::internal(format!(
                "transient failure on attempt {attempt}"
            ))
            .recoverable(true));
        }
        let mut out = Map::new();
        out.insert("ok".into(), Value::Bool(true));
        out.insert("attempts".into(), Value::from(attempt));
        Ok(out)
    }
}

/// Sleeps for `delay_ms` (default 50), observing cancellation.
pub struct SlowBlock;

#[async_trait]
impl ProcessingBlock for SlowBlock {
    fn dry_run(&self, _inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let mut out = Map::new();
        out.insert("ok".into(), Value::Bool(true));
        Ok(out)
    }

    async fn run(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError> {
        let delay_ms = inputs
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(50);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {
                let mut out = Map::new();
                out.insert("ok".into(), Value::Bool(true));
                Ok(out)
            }
            _ = ctx.cancel.cancelled() => {
                Err(BlockError::internal("cancelled while sleeping").recoverable(true))
            }
        }
    }
}
