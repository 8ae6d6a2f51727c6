//! blockflow — declarative plan execution.
//!
//! A Plan is a typed DAG of reusable Blocks with conditional gates, bounded
//! loops, and sub-flow calls. The crate validates plans statically, can
//! dry-run them with synthesized outputs, and executes them with bounded
//! parallelism, retry/timeout policy, append-only JSONL evidence logs, and
//! human-in-the-loop suspension that survives process restarts.

pub mod blocks;
pub mod config;
pub mod core;
pub mod dryrun;
pub mod dsl;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod reference;
pub mod registry;
pub mod runner;

pub use crate::blocks::{Block, BlockContext, ProcessingBlock, UiBlock, UiOutcome};
pub use crate::config::ConfigStore;
pub use crate::core::{
    export_log, log_metric, EventLogger, ExecutionContext, FakeIdGenerator, FakeTimeProvider,
    PendingUi, RunEvent, RunStateSnapshot, RunStateStore, SkipReason,
};
pub use crate::dryrun::{dry_run_plan, DryRunOptions, DryRunResult};
pub use crate::dsl::{
    load_plan, parse_plan, validate_plan, DirPlanLookup, Guard, Node, Plan, PlanFormat,
    PlanLookup, Policy, ValidateOptions, ValidationReport,
};
pub use crate::error::{BlockError, ConfigError, ErrorCode, PlanError, RegistryError, StateError};
pub use crate::graph::{build_dependency_graph, DependencyGraph};
pub use crate::registry::{BlockRegistry, BlockSpec};
pub use crate::runner::{PlanRunner, RunOptions, RunOutcome, RunStatus};
