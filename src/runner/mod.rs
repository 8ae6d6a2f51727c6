//! Plan runner: topological scheduling with bounded parallelism, policy
//! enforcement, loop/subflow orchestration, and HITL suspension.
//!
//! Processing nodes run on a bounded worker pool; UI, loop, and subflow nodes
//! run on the caller's control-flow path because they may suspend or spawn
//! child runs. The ready set is re-examined after every completion, and
//! references that cannot resolve yet defer the node instead of failing it.

mod loops;
mod node_exec;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConfigStore;
use crate::core::{
    EventLogger, ExecutionContext, IdGenerator, RealIdGenerator, RunEvent, RunStateSnapshot,
    RunStateStore, SkipReason,
};
use crate::dsl::schema::{Node, NodeOutputs, OnError, Plan, Policy};
use crate::dsl::{DirPlanLookup, PlanLookup};
use crate::error::{BlockError, ErrorCode, PlanError, PlanResult};
use crate::graph;
use crate::reference::{NodeScope, ResolveError, Scope};
use crate::registry::BlockRegistry;

pub use node_exec::summarize_outputs;

/// Environment variable: when truthy, UI blocks auto-respond via mocks and
/// runs never suspend.
pub const ENV_HEADLESS: &str = "RUNNER_HEADLESS";
/// Environment variable: default HITL mode when not set in code.
pub const ENV_DEFAULT_UI_HITL: &str = "RUNNER_DEFAULT_UI_HITL";

fn env_truthy(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

/// Per-run invocation options.
#[derive(Default)]
pub struct RunOptions {
    pub vars_overrides: Map<String, Value>,
    /// Caller-supplied context (headless mode, UI mocks, preloaded state).
    pub execution_context: Option<Arc<ExecutionContext>>,
    /// Resume a previously suspended run from its state snapshot.
    pub resume_run_id: Option<String>,
}

impl RunOptions {
    pub fn with_vars(vars_overrides: Map<String, Value>) -> Self {
        RunOptions {
            vars_overrides,
            ..Default::default()
        }
    }

    pub fn resuming(resume_run_id: impl Into<String>) -> Self {
        RunOptions {
            resume_run_id: Some(resume_run_id.into()),
            ..Default::default()
        }
    }
}

/// Terminal state of a run invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The run is waiting for a human; not a failure. Resume with
    /// [`RunOptions::resuming`] after writing the submission.
    Suspended { node_id: String },
}

/// What a `run` call returns to the host.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// `{alias -> value}` surface over all completed nodes.
    pub outputs: Map<String, Value>,
}

impl RunOutcome {
    pub fn is_suspended(&self) -> bool {
        matches!(self.status, RunStatus::Suspended { .. })
    }
}

/// Result of one graph execution, including per-node outputs for loop scope
/// overlays.
pub(crate) struct GraphRunResult {
    pub surface: Map<String, Value>,
    pub node_outputs: HashMap<String, Map<String, Value>>,
    pub status: RunStatus,
    pub succeeded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub retries: u32,
}

/// Scope adapter over the execution context plus plan metadata.
pub(crate) struct RunScope<'a> {
    pub plan: &'a Plan,
    pub ctx: &'a ExecutionContext,
    pub skipped: &'a HashSet<String>,
    pub failed: &'a HashSet<String>,
    /// Latest loop-body outputs, consulted before the context. Lets while
    /// conditions observe the body's most recent iteration.
    pub overlay: Option<&'a HashMap<String, Map<String, Value>>>,
}

impl NodeScope for RunScope<'_> {
    fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>> {
        if let Some(overlay) = self.overlay {
            if let Some(outputs) = overlay.get(node_id) {
                return Some(outputs.clone());
            }
        }
        self.ctx.node_outputs(node_id)
    }

    fn local_key_for_alias(&self, node_id: &str, alias: &str) -> Option<String> {
        let node = self.plan.node(node_id)?;
        match &node.outputs {
            Some(NodeOutputs::Aliases(map)) => map
                .iter()
                .find(|(_, a)| a.as_str() == alias)
                .map(|(local, _)| local.clone()),
            _ => None,
        }
    }

    fn is_known_node(&self, node_id: &str) -> bool {
        if let Some(overlay) = self.overlay {
            if overlay.contains_key(node_id) {
                return true;
            }
        }
        self.plan.node(node_id).is_some()
    }

    fn is_unavailable(&self, node_id: &str) -> bool {
        self.skipped.contains(node_id) || self.failed.contains(node_id)
    }
}

/// Executes validated plans.
pub struct PlanRunner {
    registry: Arc<BlockRegistry>,
    runs_dir: PathBuf,
    state_store: RunStateStore,
    config: Arc<ConfigStore>,
    plan_lookup: Arc<dyn PlanLookup>,
    id_gen: Arc<dyn IdGenerator>,
    event_mirror: Option<mpsc::UnboundedSender<Value>>,
    default_ui_hitl: bool,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl PlanRunner {
    pub fn new(registry: BlockRegistry) -> Self {
        let runs_dir = PathBuf::from("runs");
        PlanRunner {
            registry: Arc::new(registry),
            state_store: RunStateStore::new(&runs_dir),
            runs_dir,
            config: Arc::new(ConfigStore::empty()),
            plan_lookup: Arc::new(DirPlanLookup::default()),
            id_gen: Arc::new(RealIdGenerator::default()),
            event_mirror: None,
            default_ui_hitl: env_truthy(ENV_DEFAULT_UI_HITL).unwrap_or(true),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = runs_dir.into();
        self.state_store = RunStateStore::new(&self.runs_dir);
        self
    }

    pub fn with_config(mut self, config: Arc<ConfigStore>) -> Self {
        self.config = config;
        self
    }

    pub fn with_plan_lookup(mut self, lookup: Arc<dyn PlanLookup>) -> Self {
        self.plan_lookup = lookup;
        self
    }

    pub fn with_id_generator(mut self, id_gen: Arc<dyn IdGenerator>) -> Self {
        self.id_gen = id_gen;
        self
    }

    /// Mirror every emitted event record into a channel (UI progress views).
    pub fn with_event_mirror(mut self, tx: mpsc::UnboundedSender<Value>) -> Self {
        self.event_mirror = Some(tx);
        self
    }

    /// When disabled, a UI block requesting input renders immediately with
    /// its snapshot defaults instead of suspending the run.
    pub fn with_default_ui_hitl(mut self, enabled: bool) -> Self {
        self.default_ui_hitl = enabled;
        self
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub(crate) fn plan_lookup(&self) -> &Arc<dyn PlanLookup> {
        &self.plan_lookup
    }

    pub(crate) fn event_mirror(&self) -> Option<mpsc::UnboundedSender<Value>> {
        self.event_mirror.clone()
    }

    pub(crate) fn runs_dir(&self) -> &PathBuf {
        &self.runs_dir
    }

    pub(crate) fn default_ui_hitl(&self) -> bool {
        self.default_ui_hitl
    }

    // --- HITL coordination surface ---

    pub fn get_state(&self, plan_id: &str, run_id: &str) -> Option<RunStateSnapshot> {
        self.state_store.load(plan_id, run_id).ok().flatten()
    }

    pub fn save_state(
        &self,
        plan_id: &str,
        run_id: &str,
        snapshot: &RunStateSnapshot,
    ) -> PlanResult<()> {
        Ok(self.state_store.save(plan_id, run_id, snapshot)?)
    }

    pub fn find_latest_pending_ui(
        &self,
        plan_id: &str,
        prefer_run_id: Option<&str>,
    ) -> Option<(crate::core::PendingUi, String)> {
        self.state_store.find_latest_pending_ui(plan_id, prefer_run_id)
    }

    pub fn clear_state_files(&self, plan_id: &str) -> PlanResult<()> {
        Ok(self.state_store.clear_state_files(plan_id)?)
    }

    pub(crate) fn state_store(&self) -> &RunStateStore {
        &self.state_store
    }

    /// Signal external cancellation of a running plan.
    pub fn cancel(&self, run_id: &str) -> bool {
        if let Some(token) = self.active.lock().get(run_id) {
            token.cancel();
            return true;
        }
        false
    }

    /// Execute a plan. Returns partial outputs and a suspended status when a
    /// UI block awaits input.
    pub async fn run(&self, plan: &Plan, opts: RunOptions) -> PlanResult<RunOutcome> {
        let run_id = opts
            .resume_run_id
            .clone()
            .unwrap_or_else(|| self.id_gen.next_id());

        let ctx = match opts.execution_context {
            Some(ctx) => ctx,
            None => {
                let mut built = ExecutionContext::with_overrides(opts.vars_overrides.clone());
                built.headless = env_truthy(ENV_HEADLESS).unwrap_or(false);
                Arc::new(built)
            }
        };

        // Resuming reconstructs the in-memory context from the snapshot.
        let mut snapshot_overrides = Map::new();
        if opts.resume_run_id.is_some() {
            if let Some(snapshot) = self.state_store.load(&plan.id, &run_id)? {
                ctx.restore(&snapshot);
                snapshot_overrides = snapshot.vars_overrides;
            }
        }

        let mut vars = plan.vars.clone();
        for (k, v) in &snapshot_overrides {
            vars.insert(k.clone(), v.clone());
        }
        for (k, v) in &ctx.vars_overrides {
            vars.insert(k.clone(), v.clone());
        }
        for (k, v) in &opts.vars_overrides {
            vars.insert(k.clone(), v.clone());
        }
        self.active
            .lock()
            .insert(run_id.clone(), ctx.cancel.clone());

        let logger =
            EventLogger::create(&self.runs_dir, &plan.id, &run_id, self.event_mirror())?;
        logger.emit(RunEvent::Start {
            vars_overrides: ctx.vars_overrides.clone(),
            parent_run_id: None,
        });

        let result = self.run_graph(plan, &ctx, &logger, &vars, &run_id).await;
        self.active.lock().remove(&run_id);
        let graph_result = result?;

        if let RunStatus::Suspended { node_id } = &graph_result.status {
            debug!(%run_id, %node_id, "run suspended awaiting UI input");
            return Ok(RunOutcome {
                run_id,
                status: graph_result.status.clone(),
                outputs: graph_result.surface,
            });
        }

        debug!(
            %run_id,
            succeeded = graph_result.succeeded,
            skipped = graph_result.skipped,
            errored = graph_result.errored,
            retries = graph_result.retries,
            "run finished"
        );
        Ok(RunOutcome {
            run_id,
            status: RunStatus::Completed,
            outputs: graph_result.surface,
        })
    }

    /// Execute one plan graph to completion, suspension, or failure.
    pub(crate) fn run_graph<'a>(
        &'a self,
        plan: &'a Plan,
        ctx: &'a Arc<ExecutionContext>,
        logger: &'a Arc<EventLogger>,
        vars: &'a Map<String, Value>,
        run_id: &'a str,
    ) -> BoxFuture<'a, PlanResult<GraphRunResult>> {
        self.run_graph_inner(plan, ctx, logger, vars, run_id).boxed()
    }

    async fn run_graph_inner(
        &self,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        vars: &Map<String, Value>,
        run_id: &str,
    ) -> PlanResult<GraphRunResult> {
        let dep_graph = graph::build_dependency_graph(plan);
        let decl_index: HashMap<&str, usize> = plan
            .graph
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut completed: HashSet<String> = HashSet::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut deferred: HashSet<String> = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut surface: Map<String, Value> = Map::new();
        let mut node_outputs_acc: HashMap<String, Map<String, Value>> = HashMap::new();
        let mut total_retries: u32 = 0;
        let mut child_seq: u32 = 0;
        let started = std::time::Instant::now();

        let plan_policy = plan.policy.clone().unwrap_or_default();
        let max_workers = plan_policy.max_workers().max(1);
        let mut join_set: JoinSet<node_exec::NodeCompletion> = JoinSet::new();

        loop {
            if ctx.cancel.is_cancelled() {
                while join_set.join_next().await.is_some() {}
                logger.emit(RunEvent::Error {
                    node_id: None,
                    code: ErrorCode::BlockInternal.to_string(),
                    message: "run cancelled".into(),
                    recoverable: true,
                    retry: None,
                    attempt: None,
                    error_details: None,
                    traceback_trimmed: None,
                });
                return Err(PlanError::Aborted("cancelled".into()));
            }

            let mut ready: Vec<&Node> = plan
                .graph
                .iter()
                .filter(|n| {
                    !is_done(&n.id, &completed, &skipped, &failed)
                        && !in_flight.contains(&n.id)
                        && !deferred.contains(&n.id)
                })
                .filter(|n| {
                    dep_graph
                        .dependencies_of(&n.id)
                        .iter()
                        .all(|d| is_done(d, &completed, &skipped, &failed))
                })
                .collect();
            sort_ready(&mut ready, plan, &decl_index, &self.registry);

            if ready.is_empty() {
                if let Some(joined) = join_set.join_next().await {
                    let completion = joined
                        .map_err(|e| PlanError::Internal(format!("worker panicked: {e}")))?;
                    deferred.clear();
                    self.apply_completion(
                        completion,
                        plan,
                        ctx,
                        logger,
                        &mut completed,
                        &mut failed,
                        &mut in_flight,
                        &mut surface,
                        &mut node_outputs_acc,
                        &mut total_retries,
                        &mut join_set,
                    )
                    .await?;
                    continue;
                }

                let remaining: Vec<String> = plan
                    .graph
                    .iter()
                    .filter(|n| !is_done(&n.id, &completed, &skipped, &failed))
                    .map(|n| n.id.clone())
                    .collect();
                if remaining.is_empty() {
                    break;
                }
                // No progress is possible: deferred references never became
                // resolvable.
                let node_id = remaining[0].clone();
                logger.emit(RunEvent::Error {
                    node_id: Some(node_id.clone()),
                    code: ErrorCode::UnresolvedReference.to_string(),
                    message: "references could not be resolved by any execution order".into(),
                    recoverable: false,
                    retry: None,
                    attempt: None,
                    error_details: Some(Value::Array(
                        remaining.iter().map(|n| Value::String(n.clone())).collect(),
                    )),
                    traceback_trimmed: None,
                });
                return Err(PlanError::UnresolvedReference {
                    node_id,
                    reference: "unresolvable after deferral".into(),
                });
            }

            logger.emit(RunEvent::ScheduleLevelStart {
                ready: ready.iter().map(|n| n.id.clone()).collect(),
            });
            let mut executed: Vec<String> = Vec::new();

            let head = ready[0];
            if self.is_main_path(head) {
                let outcome = self
                    .execute_main_path_node(
                        head, plan, ctx, logger, vars, run_id, &completed, &skipped, &failed,
                        &mut child_seq,
                    )
                    .await?;
                match outcome {
                    node_exec::MainPathOutcome::Done {
                        outputs,
                        attempts,
                        elapsed_ms,
                    } => {
                        total_retries += attempts.saturating_sub(1);
                        self.record_success(
                            head,
                            outputs,
                            attempts,
                            elapsed_ms,
                            ctx,
                            logger,
                            &mut surface,
                            &mut node_outputs_acc,
                        );
                        completed.insert(head.id.clone());
                        deferred.clear();
                        executed.push(head.id.clone());
                    }
                    node_exec::MainPathOutcome::Skipped(reason) => {
                        logger.emit(RunEvent::NodeSkip {
                            node_id: head.id.clone(),
                            reason,
                        });
                        skipped.insert(head.id.clone());
                        deferred.clear();
                        executed.push(head.id.clone());
                    }
                    node_exec::MainPathOutcome::Deferred(reason) => {
                        logger.emit(RunEvent::NodeDefer {
                            node_id: head.id.clone(),
                            reason,
                        });
                        deferred.insert(head.id.clone());
                    }
                    node_exec::MainPathOutcome::Failed { error, attempts } => {
                        total_retries += attempts.saturating_sub(1);
                        let policy = effective_policy(head, &plan_policy);
                        self.handle_failure(
                            &head.id,
                            error,
                            attempts,
                            &policy,
                            ctx,
                            logger,
                            &mut failed,
                            &mut join_set,
                        )
                        .await?;
                        deferred.clear();
                        executed.push(head.id.clone());
                    }
                    node_exec::MainPathOutcome::Suspended => {
                        // Drain workers so the snapshot reflects a quiescent
                        // run, then hand control back to the caller.
                        while let Some(joined) = join_set.join_next().await {
                            let completion = joined.map_err(|e| {
                                PlanError::Internal(format!("worker panicked: {e}"))
                            })?;
                            self.apply_completion(
                                completion,
                                plan,
                                ctx,
                                logger,
                                &mut completed,
                                &mut failed,
                                &mut in_flight,
                                &mut surface,
                                &mut node_outputs_acc,
                                &mut total_retries,
                                &mut join_set,
                            )
                            .await?;
                        }
                        let snapshot = ctx.snapshot(completed.iter().cloned().collect());
                        self.state_store.save(&plan.id, run_id, &snapshot)?;
                        return Ok(GraphRunResult {
                            surface,
                            node_outputs: node_outputs_acc,
                            status: RunStatus::Suspended {
                                node_id: head.id.clone(),
                            },
                            succeeded: completed.len(),
                            skipped: skipped.len(),
                            errored: failed.len(),
                            retries: total_retries,
                        });
                    }
                }
                logger.emit(RunEvent::ScheduleLevelFinish {
                    executed,
                    leftover: leftover_ids(plan, &completed, &skipped, &failed),
                });
                continue;
            }

            // Dispatch processing nodes up to the worker budget. Per-node
            // max_workers hints clamp the budget for the whole round.
            let level_cap = ready
                .iter()
                .filter_map(|n| n.max_workers)
                .min()
                .map(|hint| hint.clamp(1, max_workers))
                .unwrap_or(max_workers);

            for node in ready {
                if self.is_main_path(node) {
                    // Later main-path nodes wait for their own round.
                    break;
                }
                if in_flight.len() >= level_cap {
                    break;
                }
                match self.prepare_node(node, plan, ctx, vars, &skipped, &failed) {
                    node_exec::Prep::Ready(prepared) => {
                        in_flight.insert(node.id.clone());
                        executed.push(node.id.clone());
                        let policy = effective_policy(node, &plan_policy);
                        node_exec::spawn_processing(
                            &mut join_set,
                            prepared,
                            policy,
                            logger.clone(),
                            run_id.to_string(),
                            vars.clone(),
                            ctx.cancel.child_token(),
                        );
                    }
                    node_exec::Prep::Skip(reason) => {
                        logger.emit(RunEvent::NodeSkip {
                            node_id: node.id.clone(),
                            reason,
                        });
                        skipped.insert(node.id.clone());
                        executed.push(node.id.clone());
                        deferred.clear();
                    }
                    node_exec::Prep::Defer(reason) => {
                        logger.emit(RunEvent::NodeDefer {
                            node_id: node.id.clone(),
                            reason,
                        });
                        deferred.insert(node.id.clone());
                    }
                    node_exec::Prep::Fail(error) => {
                        let policy = effective_policy(node, &plan_policy);
                        self.handle_failure(
                            &node.id,
                            error,
                            1,
                            &policy,
                            ctx,
                            logger,
                            &mut failed,
                            &mut join_set,
                        )
                        .await?;
                        deferred.clear();
                        executed.push(node.id.clone());
                    }
                }
            }

            if !join_set.is_empty() {
                if let Some(joined) = join_set.join_next().await {
                    let completion = joined
                        .map_err(|e| PlanError::Internal(format!("worker panicked: {e}")))?;
                    deferred.clear();
                    self.apply_completion(
                        completion,
                        plan,
                        ctx,
                        logger,
                        &mut completed,
                        &mut failed,
                        &mut in_flight,
                        &mut surface,
                        &mut node_outputs_acc,
                        &mut total_retries,
                        &mut join_set,
                    )
                    .await?;
                }
            }

            logger.emit(RunEvent::ScheduleLevelFinish {
                executed,
                leftover: leftover_ids(plan, &completed, &skipped, &failed),
            });
        }

        logger.emit(RunEvent::FinishSummary {
            total_nodes: plan.graph.len(),
            succeeded: completed.len(),
            skipped: skipped.len(),
            errored: failed.len(),
            total_elapsed_ms: started.elapsed().as_millis() as u64,
            total_retries,
        });

        Ok(GraphRunResult {
            surface,
            node_outputs: node_outputs_acc,
            status: RunStatus::Completed,
            succeeded: completed.len(),
            skipped: skipped.len(),
            errored: failed.len(),
            retries: total_retries,
        })
    }

    fn is_main_path(&self, node: &Node) -> bool {
        if node.is_loop() || node.is_subflow() {
            return true;
        }
        node.block
            .as_deref()
            .and_then(|id| self.registry.get(id, None).ok())
            .map(|b| b.is_ui())
            .unwrap_or(false)
    }

    /// Record a successful node completion into context, surface, and log.
    #[allow(clippy::too_many_arguments)]
    fn record_success(
        &self,
        node: &Node,
        outputs: Map<String, Value>,
        attempts: u32,
        elapsed_ms: u64,
        ctx: &ExecutionContext,
        logger: &EventLogger,
        surface: &mut Map<String, Value>,
        node_outputs_acc: &mut HashMap<String, Map<String, Value>>,
    ) {
        match &node.outputs {
            Some(NodeOutputs::Aliases(aliases)) => {
                for (local, alias) in aliases {
                    if let Some(value) = outputs.get(local) {
                        surface.insert(alias.clone(), value.clone());
                    }
                }
            }
            Some(NodeOutputs::Exports { exports }) => {
                for export in exports {
                    if let Some(value) = outputs.get(&export.alias) {
                        surface.insert(export.alias.clone(), value.clone());
                    }
                }
            }
            None => {}
        }
        logger.emit(RunEvent::NodeFinish {
            node_id: node.id.clone(),
            outputs_summary: summarize_outputs(&outputs),
            elapsed_ms,
            attempts,
        });
        if ctx.headless {
            if let Err(e) = logger.write_artifacts(&node.id, &outputs) {
                tracing::warn!(node_id = %node.id, error = %e, "artifact materialization failed");
            }
        }
        node_outputs_acc.insert(node.id.clone(), outputs.clone());
        ctx.record_outputs(&node.id, outputs);
    }

    /// Apply one worker completion to the run state.
    #[allow(clippy::too_many_arguments)]
    async fn apply_completion(
        &self,
        completion: node_exec::NodeCompletion,
        plan: &Plan,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        completed: &mut HashSet<String>,
        failed: &mut HashSet<String>,
        in_flight: &mut HashSet<String>,
        surface: &mut Map<String, Value>,
        node_outputs_acc: &mut HashMap<String, Map<String, Value>>,
        total_retries: &mut u32,
        join_set: &mut JoinSet<node_exec::NodeCompletion>,
    ) -> PlanResult<()> {
        in_flight.remove(&completion.node_id);
        let Some(node) = plan.node(&completion.node_id) else {
            return Ok(());
        };
        match completion.outcome {
            Ok(success) => {
                *total_retries += success.attempts.saturating_sub(1);
                self.record_success(
                    node,
                    success.outputs,
                    success.attempts,
                    success.elapsed_ms,
                    ctx,
                    logger,
                    surface,
                    node_outputs_acc,
                );
                completed.insert(node.id.clone());
                Ok(())
            }
            Err((error, attempts)) => {
                *total_retries += attempts.saturating_sub(1);
                let plan_policy = plan.policy.clone().unwrap_or_default();
                let policy = effective_policy(node, &plan_policy);
                self.handle_failure(
                    &node.id, error, attempts, &policy, ctx, logger, failed, join_set,
                )
                .await
            }
        }
    }

    /// Enforce the on_error policy for a terminal node failure. Under halt
    /// the run drains in-flight work and stops; under continue/retry
    /// exhaustion the node is marked failed and execution proceeds.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        node_id: &str,
        error: BlockError,
        attempts: u32,
        policy: &Policy,
        ctx: &Arc<ExecutionContext>,
        logger: &Arc<EventLogger>,
        failed: &mut HashSet<String>,
        join_set: &mut JoinSet<node_exec::NodeCompletion>,
    ) -> PlanResult<()> {
        logger.emit(RunEvent::Error {
            node_id: Some(node_id.to_string()),
            code: error.code.to_string(),
            message: error.message.clone(),
            recoverable: error.recoverable,
            retry: Some(false),
            attempt: Some(attempts),
            error_details: error.details.clone(),
            traceback_trimmed: None,
        });

        if policy.on_error == OnError::Continue {
            // Outputs stay absent; downstream references fail on their own.
            failed.insert(node_id.to_string());
            return Ok(());
        }

        // halt (and retry exhaustion): cancel in-flight work, drain, stop.
        ctx.cancel.cancel();
        while join_set.join_next().await.is_some() {}
        Err(PlanError::Block {
            node_id: node_id.to_string(),
            source: error,
        })
    }
}

/// UI nodes first in layout order, then processing nodes by advisory
/// priority, tie-broken by declaration order.
fn sort_ready(
    ready: &mut [&Node],
    plan: &Plan,
    decl_index: &HashMap<&str, usize>,
    registry: &BlockRegistry,
) {
    let is_ui = |node: &Node| {
        node.block
            .as_deref()
            .and_then(|id| registry.get(id, None).ok())
            .map(|b| b.is_ui())
            .unwrap_or(false)
    };
    ready.sort_by_key(|n| {
        (
            if is_ui(n) { 0 } else { 1 },
            plan.layout_position(&n.id).unwrap_or(usize::MAX),
            n.priority.unwrap_or(1000),
            decl_index.get(n.id.as_str()).copied().unwrap_or(usize::MAX),
        )
    });
}

fn is_done(
    id: &str,
    completed: &HashSet<String>,
    skipped: &HashSet<String>,
    failed: &HashSet<String>,
) -> bool {
    completed.contains(id) || skipped.contains(id) || failed.contains(id)
}

fn leftover_ids(
    plan: &Plan,
    completed: &HashSet<String>,
    skipped: &HashSet<String>,
    failed: &HashSet<String>,
) -> Vec<String> {
    plan.graph
        .iter()
        .filter(|n| {
            !completed.contains(&n.id) && !skipped.contains(&n.id) && !failed.contains(&n.id)
        })
        .map(|n| n.id.clone())
        .collect()
}

pub(crate) fn effective_policy(node: &Node, plan_policy: &Policy) -> Policy {
    node.policy.clone().unwrap_or_else(|| plan_policy.clone())
}

/// Map a resolve failure to the scheduler's reaction for a node: defer on
/// pending, skip on unavailable deps when guarded, fail otherwise.
pub(crate) fn resolve_failure_to_prep(node: &Node, err: ResolveError) -> node_exec::Prep {
    match err {
        ResolveError::Pending { reference, .. } => node_exec::Prep::Defer(reference),
        ResolveError::DependencyUnavailable { node_id, reference } => {
            if node.when.is_some() {
                node_exec::Prep::Skip(SkipReason::DependencyUnresolved)
            } else {
                node_exec::Prep::Fail(
                    BlockError::new(
                        ErrorCode::DependencyFailed,
                        format!("dependency '{node_id}' produced no outputs"),
                    )
                    .with_details(serde_json::json!({ "reference": reference })),
                )
            }
        }
        ResolveError::Unresolved { reference, code } => node_exec::Prep::Fail(BlockError::new(
            code,
            format!("unresolved reference '${{{reference}}}'"),
        )),
    }
}

impl PlanRunner {
    /// Guard evaluation and input resolution, shared by worker dispatch and
    /// main-path execution.
    pub(crate) fn prepare_node(
        &self,
        node: &Node,
        plan: &Plan,
        ctx: &ExecutionContext,
        vars: &Map<String, Value>,
        skipped: &HashSet<String>,
        failed: &HashSet<String>,
    ) -> node_exec::Prep {
        let run_scope = RunScope {
            plan,
            ctx,
            skipped,
            failed,
            overlay: None,
        };
        let scope = Scope::new(vars)
            .with_config(&self.config)
            .with_nodes(&run_scope);

        if let Some(guard) = &node.when {
            match crate::evaluator::evaluate_guard(guard, &scope) {
                Ok(true) => {}
                Ok(false) => return node_exec::Prep::Skip(SkipReason::WhenFalse),
                Err(e) => {
                    return match e.resolve_error() {
                        Some(ResolveError::Pending { reference, .. }) => {
                            node_exec::Prep::Defer(reference.clone())
                        }
                        Some(ResolveError::DependencyUnavailable { .. }) => {
                            node_exec::Prep::Skip(SkipReason::DependencyUnresolved)
                        }
                        _ => node_exec::Prep::Fail(e.into_block_error()),
                    };
                }
            }
        }

        let block = match &node.block {
            Some(block_id) => match self.registry.get(block_id, None) {
                Ok(block) => Some(block),
                Err(e) => {
                    return node_exec::Prep::Fail(BlockError::new(
                        ErrorCode::BlockInternal,
                        e.to_string(),
                    ))
                }
            },
            None => None,
        };

        let mut inputs = Map::new();
        for (key, value) in &node.inputs {
            match crate::reference::resolve_value(value, &scope) {
                Ok(resolved) => {
                    inputs.insert(key.clone(), resolved);
                }
                Err(e) => return resolve_failure_to_prep(node, e),
            }
        }

        // Apply spec defaults and validate required inputs and types.
        if let Some(block) = &block {
            for (key, field) in &block.spec.inputs {
                if !inputs.contains_key(key) {
                    if let Some(default) = &field.default {
                        inputs.insert(key.clone(), default.clone());
                    } else if field.is_required() {
                        return node_exec::Prep::Fail(BlockError::new(
                            ErrorCode::InputValidationFailed,
                            format!("required input '{key}' is missing"),
                        ));
                    }
                }
                if let (Some(expected), Some(value)) = (field.field_type, inputs.get(key)) {
                    if !value.is_null() && !expected.matches(value) {
                        return node_exec::Prep::Fail(BlockError::new(
                            ErrorCode::InputValidationFailed,
                            format!("input '{key}' has wrong type (expected {expected:?})"),
                        ));
                    }
                }
            }
        }

        node_exec::Prep::Ready(node_exec::PreparedNode {
            node_id: node.id.clone(),
            block_id: node.block.clone(),
            block,
            inputs,
        })
    }
}
