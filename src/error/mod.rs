//! Error taxonomy shared by the validator, runner, and block implementations.

mod block_error;
mod plan_error;

pub use block_error::{BlockError, ErrorCode};
pub use plan_error::{ConfigError, PlanError, RegistryError, StateError};

/// Convenience alias used throughout the runner.
pub type PlanResult<T> = Result<T, PlanError>;
