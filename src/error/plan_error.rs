//! Plan-level error types.

use thiserror::Error;

use super::BlockError;
use crate::dsl::validation::ValidationReport;

/// Errors surfaced by the loader, validator, and runner.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan parse error: {0}")]
    Parse(String),
    #[error("Validation failed with {} error(s)", .0.errors().len())]
    ValidationFailed(Box<ValidationReport>),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Cycle detected in plan graph: {0}")]
    CycleDetected(String),
    #[error("Unresolved reference in node '{node_id}': {reference}")]
    UnresolvedReference { node_id: String, reference: String },
    #[error("While loop '{node_id}' exceeded max_iterations={max_iterations}")]
    LoopBoundExceeded { node_id: String, max_iterations: u64 },
    #[error("Subflow plan not found: {0}")]
    SubflowNotFound(String),
    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },
    #[error("Run aborted: {0}")]
    Aborted(String),
    #[error("Block error in node '{node_id}': {source}")]
    Block {
        node_id: String,
        #[source]
        source: BlockError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlanError {
    /// The block error wrapped by this error, when one exists.
    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            PlanError::Block { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors raised by the block registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to parse block spec {path}: {message}")]
    SpecParse { path: String, message: String },
    #[error("Duplicate block spec version: {id}@{version}")]
    DuplicateVersion { id: String, version: String },
    #[error("Block id not found: {0}")]
    BlockNotFound(String),
    #[error("Version {version} not found for block {id}")]
    VersionNotFound { id: String, version: String },
    #[error("No factory registered for entrypoint '{0}'")]
    EntrypointNotRegistered(String),
    #[error("I/O error reading specs: {0}")]
    Io(String),
}

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config key not found: {0}")]
    KeyMissing(String),
    #[error("Failed to load config file {path}: {message}")]
    Load { path: String, message: String },
}

/// Errors raised by the run-state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State serialization error: {0}")]
    Serialization(String),
    #[error("State storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_display() {
        let err = PlanError::Timeout {
            node_id: "fetch".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Node 'fetch' timed out after 250ms");

        let err = PlanError::SubflowNotFound("missing_child".into());
        assert!(err.to_string().contains("missing_child"));
    }

    #[test]
    fn test_block_error_accessor() {
        let err = PlanError::Block {
            node_id: "n1".into(),
            source: BlockError::new(ErrorCode::Timeout, "slow"),
        };
        assert_eq!(err.block_error().unwrap().code, ErrorCode::Timeout);
        assert!(PlanError::Parse("x".into()).block_error().is_none());
    }
}
