//! Node execution: worker-pool dispatch for processing nodes, inline
//! execution for UI nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::blocks::{Block, BlockContext, BlockHandle, UiOutcome};
use crate::core::{EventLogger, ExecutionContext, PendingUi, RunEvent, SkipReason};
use crate::dsl::schema::{Node, OnError, Plan, Policy};
use crate::error::{BlockError, ErrorCode, PlanResult};
use crate::registry::BlockSpec;

use super::PlanRunner;

/// Outcome of guard evaluation plus input resolution for a node.
pub(crate) enum Prep {
    Ready(PreparedNode),
    Skip(SkipReason),
    Defer(String),
    Fail(BlockError),
}

pub(crate) struct PreparedNode {
    pub node_id: String,
    pub block_id: Option<String>,
    pub block: Option<Block>,
    pub inputs: Map<String, Value>,
}

pub(crate) struct NodeSuccess {
    pub outputs: Map<String, Value>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

pub(crate) struct NodeCompletion {
    pub node_id: String,
    pub outcome: Result<NodeSuccess, (BlockError, u32)>,
}

/// Result of executing a node on the caller's control-flow path.
pub(crate) enum MainPathOutcome {
    Done {
        outputs: Map<String, Value>,
        attempts: u32,
        elapsed_ms: u64,
    },
    Skipped(SkipReason),
    Deferred(String),
    Failed {
        error: BlockError,
        attempts: u32,
    },
    Suspended,
}

/// Dispatch a prepared processing node to the worker pool. The attempt loop,
/// per-attempt timeout, and retry events all live inside the worker.
pub(crate) fn spawn_processing(
    join_set: &mut JoinSet<NodeCompletion>,
    prepared: PreparedNode,
    policy: Policy,
    logger: Arc<EventLogger>,
    run_id: String,
    vars: Map<String, Value>,
    cancel: CancellationToken,
) {
    join_set.spawn(async move {
        let node_id = prepared.node_id.clone();
        let workspace = std::env::current_dir().ok();
        let Some(block) = prepared.block else {
            return NodeCompletion {
                node_id,
                outcome: Err((BlockError::internal("node has no block binding"), 1)),
            };
        };
        let BlockHandle::Processing(processing) = block.handle.clone() else {
            return NodeCompletion {
                node_id,
                outcome: Err((
                    BlockError::internal("UI block dispatched to the worker pool"),
                    1,
                )),
            };
        };

        let retries = if policy.on_error == OnError::Retry {
            policy.retries
        } else {
            0
        };
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            logger.emit(RunEvent::NodeStart {
                node_id: node_id.clone(),
                block: prepared.block_id.clone(),
                attempt,
            });

            // Retries restart the per-attempt timeout.
            let attempt_token = cancel.child_token();
            let block_ctx = BlockContext {
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                workspace: workspace.clone(),
                vars: vars.clone(),
                cancel: attempt_token.clone(),
            };
            let run_fut = processing.run(&block_ctx, prepared.inputs.clone());
            let attempt_result = match policy.timeout_ms {
                Some(ms) if ms > 0 => {
                    match tokio::time::timeout(Duration::from_millis(ms), run_fut).await {
                        Ok(result) => result,
                        Err(_) => {
                            // Cooperative blocks observe the token; others are
                            // dropped at their next await point and any
                            // blocking work they started becomes an orphan.
                            attempt_token.cancel();
                            Err(BlockError::new(
                                ErrorCode::Timeout,
                                format!("node exceeded {ms}ms timeout"),
                            )
                            .with_details(serde_json::json!({"timeout_ms": ms})))
                        }
                    }
                }
                _ => run_fut.await,
            };
            let attempt_result =
                attempt_result.and_then(|outputs| check_output_shape(&block.spec, outputs));

            match attempt_result {
                Ok(outputs) => {
                    return NodeCompletion {
                        node_id,
                        outcome: Ok(NodeSuccess {
                            outputs,
                            attempts: attempt,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        }),
                    }
                }
                Err(error) => {
                    if attempt <= retries {
                        logger.emit(RunEvent::Error {
                            node_id: Some(node_id.clone()),
                            code: error.code.to_string(),
                            message: error.message.clone(),
                            recoverable: error.recoverable,
                            retry: Some(true),
                            attempt: Some(attempt),
                            error_details: error.details.clone(),
                            traceback_trimmed: None,
                        });
                        continue;
                    }
                    return NodeCompletion {
                        node_id,
                        outcome: Err((error, attempt)),
                    };
                }
            }
        }
    });
}

/// Shape-check returned outputs against the spec's declared schema.
pub(crate) fn check_output_shape(
    spec: &BlockSpec,
    outputs: Map<String, Value>,
) -> Result<Map<String, Value>, BlockError> {
    for (key, field) in &spec.outputs {
        match outputs.get(key) {
            None => {
                if field.is_required() {
                    return Err(BlockError::new(
                        ErrorCode::OutputSchemaMismatch,
                        format!("declared output '{key}' is missing"),
                    ));
                }
            }
            Some(value) => {
                if let Some(expected) = field.field_type {
                    if !value.is_null() && !expected.matches(value) {
                        return Err(BlockError::new(
                            ErrorCode::OutputSchemaMismatch,
                            format!("output '{key}' has wrong type (expected {expected:?})"),
                        ));
                    }
                }
            }
        }
    }
    Ok(outputs)
}

/// Compact per-node output description for `node_finish` events. Large values
/// are summarized rather than copied into the log.
pub fn summarize_outputs(outputs: &Map<String, Value>) -> Value {
    let mut summary = Map::new();
    for (key, value) in outputs {
        let rendered = match value {
            Value::String(s) if s.len() > 120 => {
                let cut = s
                    .char_indices()
                    .map(|(i, _)| i)
                    .take_while(|i| *i <= 117)
                    .last()
                    .unwrap_or(0);
                Value::String(format!("{}... ({} chars)", &s[..cut], s.len()))
            }
            Value::Array(items) => serde_json::json!({"items": items.len()}),
            Value::Object(map) => {
                serde_json::json!({"keys": map.keys().cloned().collect::<Vec<_>>()})
            }
            other => other.clone(),
        };
        summary.insert(key.clone(), rendered);
    }
    Value::Object(summary)
}

impl PlanRunner {
    /// Execute a UI, loop, or subflow node on the caller's path.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute_main_path_node(
        &self,
        node: &Node,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        completed: &std::collections::HashSet<String>,
        skipped: &std::collections::HashSet<String>,
        failed: &std::collections::HashSet<String>,
        child_seq: &mut u32,
    ) -> PlanResult<MainPathOutcome> {
        let prepared = match self.prepare_node(node, plan, ctx, vars, skipped, failed) {
            Prep::Ready(prepared) => prepared,
            Prep::Skip(reason) => return Ok(MainPathOutcome::Skipped(reason)),
            Prep::Defer(reason) => return Ok(MainPathOutcome::Deferred(reason)),
            Prep::Fail(error) => {
                return Ok(MainPathOutcome::Failed { error, attempts: 1 })
            }
        };

        if node.is_loop() {
            return self
                .run_loop_node(node, plan, ctx, logger, vars, run_id, skipped, failed, child_seq)
                .await;
        }
        if node.is_subflow() {
            return self
                .run_subflow_node(node, plan, ctx, logger, vars, run_id, skipped, failed, child_seq)
                .await;
        }
        self.execute_ui_node(node, prepared, plan, ctx, logger, vars, run_id, completed)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_ui_node(
        &self,
        node: &Node,
        prepared: PreparedNode,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        completed: &std::collections::HashSet<String>,
    ) -> PlanResult<MainPathOutcome> {
        let Some(block) = &prepared.block else {
            return Ok(MainPathOutcome::Failed {
                error: BlockError::internal("UI node without a block"),
                attempts: 1,
            });
        };
        let BlockHandle::Ui(ui) = block.handle.clone() else {
            return Ok(MainPathOutcome::Failed {
                error: BlockError::internal("expected a UI block"),
                attempts: 1,
            });
        };

        // Consume a submission left on the pending record, or a previously
        // collected output for this node.
        enum SubmissionKind {
            Submit,
            Reuse,
        }
        let mut submission: Option<Value> = None;
        let mut kind: Option<SubmissionKind> = None;
        if let Some(pending) = ctx.pending_ui() {
            if pending.node_id == node.id {
                // A submission arrives either on the pending record itself or
                // as an injected ui_output written before resuming.
                if pending.submitted && pending.outputs.is_some() {
                    submission = pending.outputs.clone();
                    kind = Some(SubmissionKind::Submit);
                    ctx.set_pending_ui(None);
                } else if let Some(injected) = ctx.ui_output(&node.id) {
                    submission = Some(injected);
                    kind = Some(SubmissionKind::Submit);
                    ctx.set_pending_ui(None);
                }
            } else if pending.submitted {
                // A submission for another node: bank it and clear the
                // pending slot.
                if let Some(outputs) = pending.outputs.clone() {
                    ctx.set_ui_output(&pending.node_id, outputs);
                }
                ctx.set_pending_ui(None);
                let snapshot = ctx.snapshot(completed.iter().cloned().collect());
                self.state_store().save(&plan.id, run_id, &snapshot)?;
            }
        }
        if submission.is_none() {
            if let Some(previous) = ctx.ui_output(&node.id) {
                submission = Some(previous);
                kind = Some(SubmissionKind::Reuse);
            }
        }

        let started = Instant::now();
        let block_ctx = BlockContext {
            run_id: run_id.to_string(),
            node_id: node.id.clone(),
            workspace: ctx.workspace.clone().or_else(|| std::env::current_dir().ok()),
            vars: vars.clone(),
            cancel: ctx.cancel.child_token(),
        };
        let outcome = ui
            .render(&block_ctx, prepared.inputs.clone(), ctx, submission)
            .await;

        match outcome {
            Err(error) => Ok(MainPathOutcome::Failed { error, attempts: 1 }),
            Ok(UiOutcome::Outputs(outputs)) => {
                match kind {
                    Some(SubmissionKind::Submit) => logger.emit(RunEvent::UiSubmit {
                        node_id: node.id.clone(),
                    }),
                    Some(SubmissionKind::Reuse) => logger.emit(RunEvent::UiReuse {
                        node_id: node.id.clone(),
                    }),
                    None => {}
                }
                logger.emit(RunEvent::NodeStart {
                    node_id: node.id.clone(),
                    block: prepared.block_id.clone(),
                    attempt: 1,
                });
                ctx.set_ui_output(&node.id, Value::Object(outputs.clone()));
                if !ctx.headless {
                    let snapshot = ctx.snapshot(completed.iter().cloned().collect());
                    self.state_store().save(&plan.id, run_id, &snapshot)?;
                }
                Ok(MainPathOutcome::Done {
                    outputs,
                    attempts: 1,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Ok(UiOutcome::AwaitInput { snapshot }) => {
                if ctx.headless || !self.default_ui_hitl() {
                    // Immediate-render fallback: the node completes with
                    // whatever defaults the block snapshotted.
                    let outputs = snapshot.unwrap_or_default();
                    logger.emit(RunEvent::NodeStart {
                        node_id: node.id.clone(),
                        block: prepared.block_id.clone(),
                        attempt: 1,
                    });
                    ctx.set_ui_output(&node.id, Value::Object(outputs.clone()));
                    return Ok(MainPathOutcome::Done {
                        outputs,
                        attempts: 1,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                let pending = PendingUi {
                    node_id: node.id.clone(),
                    inputs: snapshot.unwrap_or(prepared.inputs),
                    submitted: false,
                    outputs: None,
                    ts: chrono::Utc::now().to_rfc3339(),
                };
                ctx.set_pending_ui(Some(pending));
                logger.emit(RunEvent::UiWait {
                    node_id: node.id.clone(),
                });
                Ok(MainPathOutcome::Suspended)
            }
        }
    }
}
