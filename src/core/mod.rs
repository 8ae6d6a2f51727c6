//! Run-scoped state: execution context, on-disk snapshots, evidence log, and
//! time/id providers.

pub mod context;
pub mod events;
pub mod providers;
pub mod state;

pub use context::ExecutionContext;
pub use events::{export_log, log_metric, EventLogger, RunEvent, SkipReason};
pub use providers::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    TimeProvider, UuidIdGenerator,
};
pub use state::{PendingUi, RunStateSnapshot, RunStateStore};
