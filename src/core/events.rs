//! Structured run events and the append-only JSONL evidence log.
//!
//! Every record is a single line carrying `{ts, plan, run_id, schema, type,
//! ...}`. Writes are serialized behind a mutex so concurrent workers never
//! interleave fragments, and timestamps are clamped monotonic per run.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::StateError;

/// Reasons attached to `node_skip` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    WhenFalse,
    DependencyUnresolved,
}

/// All event types emitted into the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Start {
        vars_overrides: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<String>,
    },
    ScheduleLevelStart {
        ready: Vec<String>,
    },
    ScheduleLevelFinish {
        executed: Vec<String>,
        leftover: Vec<String>,
    },
    NodeStart {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        block: Option<String>,
        attempt: u32,
    },
    NodeFinish {
        node_id: String,
        outputs_summary: Value,
        elapsed_ms: u64,
        attempts: u32,
    },
    NodeDefer {
        node_id: String,
        reason: String,
    },
    NodeSkip {
        node_id: String,
        reason: SkipReason,
    },
    LoopIterStart {
        node_id: String,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    LoopIterFinish {
        node_id: String,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    SubflowStart {
        node_id: String,
        child_run_id: String,
    },
    SubflowFinish {
        node_id: String,
        child_run_id: String,
    },
    UiWait {
        node_id: String,
    },
    UiSubmit {
        node_id: String,
    },
    UiReuse {
        node_id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        code: String,
        message: String,
        recoverable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_details: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback_trimmed: Option<String>,
    },
    FinishSummary {
        total_nodes: usize,
        succeeded: usize,
        skipped: usize,
        errored: usize,
        total_elapsed_ms: u64,
        total_retries: u32,
    },
    Debug {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        data: Value,
        level: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    Metric {
        name: String,
        value: Value,
        tags: Map<String, Value>,
    },
}

struct LoggerInner {
    file: std::fs::File,
    last_ts: String,
}

/// Append-only JSONL logger for a single run. The logger owns the file
/// handle; producers emit through a thread-safe append.
pub struct EventLogger {
    plan_id: String,
    run_id: String,
    log_path: PathBuf,
    run_dir: PathBuf,
    inner: Mutex<LoggerInner>,
    mirror: Option<mpsc::UnboundedSender<Value>>,
}

impl EventLogger {
    /// Create the log file at `runs/<plan_id>/<run_id>.jsonl` (appending when
    /// resuming an existing run) and register the handle for ad-hoc emission.
    pub fn create(
        runs_dir: &std::path::Path,
        plan_id: &str,
        run_id: &str,
        mirror: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<Arc<Self>, StateError> {
        let plan_dir = runs_dir.join(plan_id);
        std::fs::create_dir_all(&plan_dir).map_err(|e| StateError::Storage(e.to_string()))?;
        let log_path = plan_dir.join(format!("{run_id}.jsonl"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| StateError::Storage(e.to_string()))?;
        let logger = Arc::new(EventLogger {
            plan_id: plan_id.to_string(),
            run_id: run_id.to_string(),
            log_path,
            run_dir: plan_dir.join(run_id),
            inner: Mutex::new(LoggerInner {
                file,
                last_ts: String::new(),
            }),
            mirror,
        });
        register_logger(logger.clone());
        Ok(logger)
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one event. Log I/O failures are reported through `tracing` and
    /// never break the run.
    pub fn emit(&self, event: RunEvent) {
        let Ok(Value::Object(fields)) = serde_json::to_value(&event) else {
            return;
        };
        self.emit_fields(fields);
    }

    fn emit_fields(&self, fields: Map<String, Value>) {
        let mut record = Map::new();
        let mut inner = self.inner.lock();

        // Event timestamps are monotonic per run even if the wall clock steps
        // backwards.
        let mut ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        if ts < inner.last_ts {
            ts = inner.last_ts.clone();
        }
        inner.last_ts = ts.clone();

        record.insert("ts".into(), Value::String(ts));
        record.insert("plan".into(), Value::String(self.plan_id.clone()));
        record.insert("run_id".into(), Value::String(self.run_id.clone()));
        record.insert("schema".into(), Value::String("v1".into()));
        for (k, v) in fields {
            record.insert(k, v);
        }

        let value = Value::Object(record);
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = inner.file.write_all(line.as_bytes()) {
            warn!(run_id = %self.run_id, error = %e, "failed to append run event");
        }
        drop(inner);

        if let Some(mirror) = &self.mirror {
            let _ = mirror.send(value);
        }
    }

    /// Materialize a per-node output snapshot under
    /// `runs/<plan_id>/<run_id>/artifacts/`, plus raw bytes for any binary
    /// file descriptors found among the outputs.
    pub fn write_artifacts(
        &self,
        node_id: &str,
        outputs: &Map<String, Value>,
    ) -> Result<(), StateError> {
        let artifacts_dir = self.run_dir.join("artifacts");
        std::fs::create_dir_all(&artifacts_dir).map_err(|e| StateError::Storage(e.to_string()))?;
        let snapshot_path = artifacts_dir.join(format!("{node_id}_outputs.json"));
        let body = serde_json::to_vec_pretty(&Value::Object(outputs.clone()))
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        std::fs::write(&snapshot_path, body).map_err(|e| StateError::Storage(e.to_string()))?;

        for value in outputs.values() {
            if let Some((name, bytes)) = super::state::descriptor_bytes(value) {
                // File descriptors carry their own declared filename.
                let safe_name = name.replace(['/', '\\'], "_");
                std::fs::write(artifacts_dir.join(safe_name), bytes)
                    .map_err(|e| StateError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        unregister_logger(&self.run_id);
    }
}

// Process-wide registry so blocks and utilities can emit ad-hoc events
// through a run id without holding the logger.
static RUN_LOGGERS: LazyLock<Mutex<HashMap<String, std::sync::Weak<EventLogger>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn register_logger(logger: Arc<EventLogger>) {
    RUN_LOGGERS
        .lock()
        .insert(logger.run_id.clone(), Arc::downgrade(&logger));
}

fn unregister_logger(run_id: &str) {
    RUN_LOGGERS.lock().remove(run_id);
}

fn lookup_logger(run_id: &str) -> Option<Arc<EventLogger>> {
    RUN_LOGGERS.lock().get(run_id).and_then(|weak| weak.upgrade())
}

/// Emit a free-form `debug` event into the run log. Unknown run ids are
/// ignored so user code never crashes over logging.
pub fn export_log(run_id: &str, tag: Option<&str>, data: Value, node_id: Option<&str>) {
    if let Some(logger) = lookup_logger(run_id) {
        logger.emit(RunEvent::Debug {
            tag: tag.map(|t| t.to_string()),
            data,
            level: "debug".into(),
            node_id: node_id.map(|n| n.to_string()),
        });
    }
}

/// Record a named metric as a run event.
pub fn log_metric(run_id: &str, name: &str, value: Value, tags: Option<Map<String, Value>>) {
    if let Some(logger) = lookup_logger(run_id) {
        logger.emit(RunEvent::Metric {
            name: name.to_string(),
            value,
            tags: tags.unwrap_or_default(),
        });
    }
}
