//! Loop and subflow orchestration.
//!
//! Loop bodies and subflow children run in child runners with their own
//! execution context, event log, and worker pool. Foreach iterations may run
//! concurrently, but the collected sequence always follows input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};

use crate::core::{EventLogger, ExecutionContext, RunEvent};
use crate::dsl::schema::{ForeachSpec, Node, OnError, Plan, WhileSpec};
use crate::error::{BlockError, ErrorCode, PlanError, PlanResult};
use crate::evaluator;
use crate::reference::{self, ResolveError, Scope};

use super::node_exec::MainPathOutcome;
use super::{effective_policy, GraphRunResult, PlanRunner, RunScope, RunStatus};

const DEFAULT_FOREACH_CONCURRENCY: usize = 4;

fn plan_error_to_block(error: PlanError) -> BlockError {
    match error {
        PlanError::Block { source, .. } => source,
        PlanError::LoopBoundExceeded { max_iterations, .. } => BlockError::new(
            ErrorCode::LoopBoundExceeded,
            format!("loop exceeded max_iterations={max_iterations}"),
        ),
        PlanError::SubflowNotFound(plan_id) => BlockError::new(
            ErrorCode::SubflowNotFound,
            format!("subflow plan not found: {plan_id}"),
        ),
        PlanError::Timeout { timeout_ms, .. } => BlockError::new(
            ErrorCode::Timeout,
            format!("child run exceeded {timeout_ms}ms"),
        ),
        other => BlockError::internal(other.to_string()),
    }
}

/// Body plans may omit an id; derive one from the parent for run directories.
fn effective_body_plan(parent: &Plan, node: &Node) -> Option<Plan> {
    let body = node.body.as_ref()?;
    let mut plan = body.plan.clone();
    if plan.id.is_empty() {
        plan.id = format!("{}__{}", parent.id, node.id);
    }
    Some(plan)
}

/// The element a loop contributes per iteration: the export named by the
/// collect alias when present, the whole exported map otherwise.
fn collect_element(
    node: &Node,
    body_plan: &Plan,
    child_surface: &Map<String, Value>,
) -> Value {
    let exported = body_plan.exported_surface(child_surface);
    let collect_alias = node.alias_map().and_then(|m| m.get("collect").cloned());
    collect_alias
        .and_then(|alias| exported.get(&alias).cloned())
        .unwrap_or(Value::Object(exported))
}

impl PlanRunner {
    /// Run a child plan with its own context and event log segment.
    pub(crate) async fn run_child(
        &self,
        child_plan: &Plan,
        child_vars: &Map<String, Value>,
        overrides: Map<String, Value>,
        child_run_id: &str,
        parent_run_id: &str,
        parent_ctx: &ExecutionContext,
    ) -> PlanResult<GraphRunResult> {
        let child_ctx = parent_ctx.child(overrides.clone());
        let logger = EventLogger::create(
            self.runs_dir(),
            &child_plan.id,
            child_run_id,
            self.event_mirror(),
        )?;
        logger.emit(RunEvent::Start {
            vars_overrides: overrides,
            parent_run_id: Some(parent_run_id.to_string()),
        });
        self.run_graph(child_plan, &child_ctx, &logger, child_vars, child_run_id)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_loop_node(
        &self,
        node: &Node,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        skipped: &std::collections::HashSet<String>,
        failed: &std::collections::HashSet<String>,
        child_seq: &mut u32,
    ) -> PlanResult<MainPathOutcome> {
        let Some(body_plan) = effective_body_plan(plan, node) else {
            return Ok(MainPathOutcome::Failed {
                error: BlockError::internal("loop node without a body"),
                attempts: 1,
            });
        };
        if let Some(foreach) = &node.foreach {
            self.run_foreach(
                foreach, node, &body_plan, plan, ctx, logger, vars, run_id, skipped, failed,
                child_seq,
            )
            .await
        } else if let Some(while_) = &node.while_ {
            self.run_while(
                while_, node, &body_plan, plan, ctx, logger, vars, run_id, skipped, failed,
                child_seq,
            )
            .await
        } else {
            Ok(MainPathOutcome::Failed {
                error: BlockError::internal("loop node requires foreach or while"),
                attempts: 1,
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_foreach(
        &self,
        foreach: &ForeachSpec,
        node: &Node,
        body_plan: &Plan,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        skipped: &std::collections::HashSet<String>,
        failed: &std::collections::HashSet<String>,
        child_seq: &mut u32,
    ) -> PlanResult<MainPathOutcome> {
        let started = Instant::now();

        let run_scope = RunScope {
            plan,
            ctx,
            skipped,
            failed,
            overlay: None,
        };
        let scope = Scope::new(vars)
            .with_config(self.config())
            .with_nodes(&run_scope);
        let input = match reference::resolve_value(&foreach.input, &scope) {
            Ok(value) => value,
            Err(ResolveError::Pending { reference, .. }) => {
                return Ok(MainPathOutcome::Deferred(reference))
            }
            Err(e) => {
                return Ok(MainPathOutcome::Failed {
                    error: BlockError::new(e.code(), e.to_string()),
                    attempts: 1,
                })
            }
        };

        // Maps iterate over their values, with keys recorded on iteration
        // events.
        let items: Vec<(Option<String>, Value)> = match input {
            Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            other => {
                return Ok(MainPathOutcome::Failed {
                    error: BlockError::new(
                        ErrorCode::InputValidationFailed,
                        format!("foreach.input must be iterable, got {other}"),
                    ),
                    attempts: 1,
                })
            }
        };

        let max_concurrency = foreach
            .max_concurrency
            .unwrap_or(DEFAULT_FOREACH_CONCURRENCY)
            .max(1);
        let policy = effective_policy(node, &plan.policy.clone().unwrap_or_default());
        let total = items.len();
        let base_seq = *child_seq;
        *child_seq += items.len() as u32;

        let futures = items.into_iter().enumerate().map(|(index, (key, item))| {
            let mut child_vars = vars.clone();
            child_vars.insert(foreach.item_var.clone(), item.clone());
            child_vars.insert(foreach.index_var.clone(), Value::from(index));
            let mut overrides = Map::new();
            overrides.insert(foreach.item_var.clone(), item);
            overrides.insert(foreach.index_var.clone(), Value::from(index));
            let child_run_id = format!("{run_id}#{}", base_seq + index as u32 + 1);
            let logger = logger.clone();
            let node_id = node.id.clone();
            async move {
                logger.emit(RunEvent::LoopIterStart {
                    node_id: node_id.clone(),
                    index,
                    key: key.clone(),
                });
                let result = self
                    .run_child(body_plan, &child_vars, overrides, &child_run_id, run_id, ctx)
                    .await;
                logger.emit(RunEvent::LoopIterFinish {
                    node_id,
                    index,
                    key,
                });
                (index, result)
            }
        });

        // Bounded dispatch; results land in an index-keyed map so the
        // collected sequence matches input order regardless of completion
        // order.
        let mut stream = stream::iter(futures).buffer_unordered(max_concurrency);
        let mut by_index: HashMap<usize, Value> = HashMap::new();
        while let Some((index, result)) = stream.next().await {
            match result {
                Ok(child) => {
                    if let RunStatus::Suspended { node_id } = &child.status {
                        return Ok(MainPathOutcome::Failed {
                            error: BlockError::internal(format!(
                                "UI suspension inside a loop body is not supported (node '{node_id}')"
                            )),
                            attempts: 1,
                        });
                    }
                    by_index.insert(index, collect_element(node, body_plan, &child.surface));
                }
                Err(error) => {
                    if policy.on_error == OnError::Continue {
                        let block_error = plan_error_to_block(error);
                        logger.emit(RunEvent::Error {
                            node_id: Some(node.id.clone()),
                            code: block_error.code.to_string(),
                            message: format!("iteration {index}: {}", block_error.message),
                            recoverable: block_error.recoverable,
                            retry: None,
                            attempt: None,
                            error_details: block_error.details.clone(),
                            traceback_trimmed: None,
                        });
                        by_index.insert(index, Value::Null);
                        continue;
                    }
                    // halt: dropping the stream cancels outstanding
                    // iterations.
                    drop(stream);
                    return Ok(MainPathOutcome::Failed {
                        error: plan_error_to_block(error),
                        attempts: 1,
                    });
                }
            }
        }

        let collected: Vec<Value> = (0..total)
            .map(|i| by_index.remove(&i).unwrap_or(Value::Null))
            .collect();
        let mut outputs = Map::new();
        outputs.insert("collect".into(), Value::Array(collected));
        Ok(MainPathOutcome::Done {
            outputs,
            attempts: 1,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_while(
        &self,
        while_: &WhileSpec,
        node: &Node,
        body_plan: &Plan,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        skipped: &std::collections::HashSet<String>,
        failed: &std::collections::HashSet<String>,
        child_seq: &mut u32,
    ) -> PlanResult<MainPathOutcome> {
        let max_iterations = while_.max_iterations.unwrap_or(1).max(1) as usize;
        let policy = effective_policy(node, &plan.policy.clone().unwrap_or_default());
        let started = Instant::now();

        // Later iterations see the body's most recent outputs through this
        // overlay, so conditions like `${counter.n} < 3` observe progress.
        let mut overlay: HashMap<String, Map<String, Value>> = HashMap::new();
        let mut collected: Vec<Value> = Vec::new();
        let mut iterations = 0usize;

        loop {
            let run_scope = RunScope {
                plan,
                ctx,
                skipped,
                failed,
                overlay: Some(&overlay),
            };
            let scope = Scope::new(vars)
                .with_config(self.config())
                .with_nodes(&run_scope);
            let condition = match evaluator::evaluate_guard(&while_.condition, &scope) {
                Ok(condition) => condition,
                Err(e) => {
                    if iterations == 0 {
                        if let Some(ResolveError::Pending { reference, .. }) = e.resolve_error() {
                            return Ok(MainPathOutcome::Deferred(reference.clone()));
                        }
                    }
                    return Ok(MainPathOutcome::Failed {
                        error: e.into_block_error(),
                        attempts: 1,
                    });
                }
            };
            if !condition {
                break;
            }
            if iterations >= max_iterations {
                return Ok(MainPathOutcome::Failed {
                    error: BlockError::new(
                        ErrorCode::LoopBoundExceeded,
                        format!(
                            "while condition still true after max_iterations={max_iterations}"
                        ),
                    ),
                    attempts: 1,
                });
            }

            *child_seq += 1;
            let child_run_id = format!("{run_id}#{child_seq}");
            logger.emit(RunEvent::LoopIterStart {
                node_id: node.id.clone(),
                index: iterations,
                key: None,
            });
            let result = self
                .run_child(body_plan, vars, Map::new(), &child_run_id, run_id, ctx)
                .await;
            logger.emit(RunEvent::LoopIterFinish {
                node_id: node.id.clone(),
                index: iterations,
                key: None,
            });

            match result {
                Ok(child) => {
                    if let RunStatus::Suspended { node_id } = &child.status {
                        return Ok(MainPathOutcome::Failed {
                            error: BlockError::internal(format!(
                                "UI suspension inside a loop body is not supported (node '{node_id}')"
                            )),
                            attempts: 1,
                        });
                    }
                    overlay.extend(child.node_outputs.clone());
                    collected.push(collect_element(node, body_plan, &child.surface));
                }
                Err(error) => {
                    let block_error = plan_error_to_block(error);
                    if policy.on_error == OnError::Continue {
                        logger.emit(RunEvent::Error {
                            node_id: Some(node.id.clone()),
                            code: block_error.code.to_string(),
                            message: format!("iteration {iterations}: {}", block_error.message),
                            recoverable: block_error.recoverable,
                            retry: None,
                            attempt: None,
                            error_details: block_error.details.clone(),
                            traceback_trimmed: None,
                        });
                        break;
                    }
                    return Ok(MainPathOutcome::Failed {
                        error: block_error,
                        attempts: 1,
                    });
                }
            }
            iterations += 1;
        }

        let mut outputs = Map::new();
        outputs.insert("collect".into(), Value::Array(collected));
        Ok(MainPathOutcome::Done {
            outputs,
            attempts: 1,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_subflow_node(
        &self,
        node: &Node,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
        skipped: &std::collections::HashSet<String>,
        failed: &std::collections::HashSet<String>,
        child_seq: &mut u32,
    ) -> PlanResult<MainPathOutcome> {
        let Some(call) = &node.call else {
            return Ok(MainPathOutcome::Failed {
                error: BlockError::internal("subflow node without a call"),
                attempts: 1,
            });
        };
        let started = Instant::now();

        let child_plan = match self.plan_lookup().find_plan(&call.plan_id) {
            Ok(child_plan) => child_plan,
            Err(_) => {
                return Ok(MainPathOutcome::Failed {
                    error: BlockError::new(
                        ErrorCode::SubflowNotFound,
                        format!("subflow plan not found: {}", call.plan_id),
                    ),
                    attempts: 1,
                })
            }
        };

        // Children inherit nothing implicitly; call.inputs become the
        // child's variable overrides.
        let run_scope = RunScope {
            plan,
            ctx,
            skipped,
            failed,
            overlay: None,
        };
        let scope = Scope::new(vars)
            .with_config(self.config())
            .with_nodes(&run_scope);
        let mut resolved_inputs = Map::new();
        for (key, value) in &call.inputs {
            match reference::resolve_value(value, &scope) {
                Ok(resolved) => {
                    resolved_inputs.insert(key.clone(), resolved);
                }
                Err(ResolveError::Pending { reference, .. }) => {
                    return Ok(MainPathOutcome::Deferred(reference))
                }
                Err(e) => {
                    return Ok(MainPathOutcome::Failed {
                        error: BlockError::new(e.code(), e.to_string()),
                        attempts: 1,
                    })
                }
            }
        }

        let mut child_vars = child_plan.vars.clone();
        for (k, v) in &resolved_inputs {
            child_vars.insert(k.clone(), v.clone());
        }

        *child_seq += 1;
        let child_run_id = format!("{run_id}#{child_seq}");
        logger.emit(RunEvent::SubflowStart {
            node_id: node.id.clone(),
            child_run_id: child_run_id.clone(),
        });
        let result = self
            .run_child(
                &child_plan,
                &child_vars,
                resolved_inputs,
                &child_run_id,
                run_id,
                ctx,
            )
            .await;
        logger.emit(RunEvent::SubflowFinish {
            node_id: node.id.clone(),
            child_run_id,
        });

        let child = match result {
            Ok(child) => child,
            Err(error) => {
                return Ok(MainPathOutcome::Failed {
                    error: plan_error_to_block(error),
                    attempts: 1,
                })
            }
        };
        if let RunStatus::Suspended { node_id } = &child.status {
            return Ok(MainPathOutcome::Failed {
                error: BlockError::internal(format!(
                    "UI suspension inside a subflow is not supported (node '{node_id}')"
                )),
                attempts: 1,
            });
        }

        let child_surface = child_plan.exported_surface(&child.surface);
        let mut outputs = Map::new();
        if let Some(exports) = node.export_list() {
            for export in exports {
                outputs.insert(
                    export.alias.clone(),
                    child_surface.get(&export.from).cloned().unwrap_or(Value::Null),
                );
            }
        }
        Ok(MainPathOutcome::Done {
            outputs,
            attempts: 1,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
