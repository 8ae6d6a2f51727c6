use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Machine-readable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InputValidationFailed,
    OutputSchemaMismatch,
    UnresolvedReference,
    CycleDetected,
    UnsafeExpression,
    LoopBoundExceeded,
    SubflowNotFound,
    Timeout,
    DependencyFailed,
    ConfigKeyMissing,
    EnvKeyMissing,
    BlockInternal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InputValidationFailed => "INPUT_VALIDATION_FAILED",
            ErrorCode::OutputSchemaMismatch => "OUTPUT_SCHEMA_MISMATCH",
            ErrorCode::UnresolvedReference => "UNRESOLVED_REFERENCE",
            ErrorCode::CycleDetected => "CYCLE_DETECTED",
            ErrorCode::UnsafeExpression => "UNSAFE_EXPRESSION",
            ErrorCode::LoopBoundExceeded => "LOOP_BOUND_EXCEEDED",
            ErrorCode::SubflowNotFound => "SUBFLOW_NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorCode::ConfigKeyMissing => "CONFIG_KEY_MISSING",
            ErrorCode::EnvKeyMissing => "ENV_KEY_MISSING",
            ErrorCode::BlockInternal => "BLOCK_INTERNAL",
        }
    }

    /// Transient failures may be resumed; structural ones require a new run.
    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::InputValidationFailed
                | ErrorCode::DependencyFailed
                | ErrorCode::BlockInternal
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error raised by a block or by the runner on a block's behalf.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct BlockError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub recoverable: bool,
}

impl BlockError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        BlockError {
            code,
            message: message.into(),
            details: None,
            recoverable: code.default_recoverable(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BlockInternal, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}
