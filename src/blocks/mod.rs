//! Block abstractions.
//!
//! Blocks come in two variants: processing blocks (pure computation, may read
//! external systems, never mutate runner state) and UI blocks (interactive,
//! may request suspension). The registry hands both out behind [`Block`].

pub mod builtin;
pub mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::ExecutionContext;
use crate::error::BlockError;
use crate::registry::spec::BlockSpec;

/// Immutable context handed to every block invocation.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub run_id: String,
    pub node_id: String,
    pub workspace: Option<PathBuf>,
    pub vars: Map<String, Value>,
    /// Cooperative cancellation; blocks should check it at I/O boundaries.
    pub cancel: CancellationToken,
}

impl BlockContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        BlockContext {
            run_id: run_id.into(),
            node_id: String::new(),
            workspace: None,
            vars: Map::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Pure computation unit. Must be effectively deterministic given inputs and
/// context.
#[async_trait]
pub trait ProcessingBlock: Send + Sync {
    /// Static self-check of the block's preconditions.
    fn validate(&self) -> Result<(), BlockError> {
        Ok(())
    }

    /// Produce a representative output without external effects.
    fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let _ = inputs;
        Ok(Map::new())
    }

    async fn run(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
    ) -> Result<Map<String, Value>, BlockError>;
}

/// Result of rendering a UI block.
#[derive(Debug, Clone)]
pub enum UiOutcome {
    Outputs(Map<String, Value>),
    /// The block is waiting for a human; the run suspends.
    AwaitInput { snapshot: Option<Map<String, Value>> },
}

/// Interactive unit. `submission` carries a previously collected user
/// response (from `ui_outputs`) when the run is resumed.
#[async_trait]
pub trait UiBlock: Send + Sync {
    fn validate(&self) -> Result<(), BlockError> {
        Ok(())
    }

    fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        let _ = inputs;
        Ok(Map::new())
    }

    async fn render(
        &self,
        ctx: &BlockContext,
        inputs: Map<String, Value>,
        exec: &ExecutionContext,
        submission: Option<Value>,
    ) -> Result<UiOutcome, BlockError>;
}

/// A constructed block instance plus its spec.
#[derive(Clone)]
pub struct Block {
    pub spec: Arc<BlockSpec>,
    pub handle: BlockHandle,
}

#[derive(Clone)]
pub enum BlockHandle {
    Processing(Arc<dyn ProcessingBlock>),
    Ui(Arc<dyn UiBlock>),
}

impl Block {
    pub fn is_ui(&self) -> bool {
        matches!(self.handle, BlockHandle::Ui(_))
    }

    pub fn validate(&self) -> Result<(), BlockError> {
        match &self.handle {
            BlockHandle::Processing(p) => p.validate(),
            BlockHandle::Ui(u) => u.validate(),
        }
    }

    /// Block-provided representative outputs; the dry-run engine prefers
    /// spec-declared samples and falls back to these.
    pub fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, BlockError> {
        match &self.handle {
            BlockHandle::Processing(p) => p.dry_run(inputs),
            BlockHandle::Ui(u) => u.dry_run(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl ProcessingBlock for Nop {
        async fn run(
            &self,
            _ctx: &BlockContext,
            inputs: Map<String, Value>,
        ) -> Result<Map<String, Value>, BlockError> {
            Ok(inputs)
        }
    }

    #[tokio::test]
    async fn test_default_trait_methods() {
        let block = Nop;
        assert!(block.validate().is_ok());
        assert!(block.dry_run(&Map::new()).unwrap().is_empty());
        let ctx = BlockContext::new("r");
        let out = block.run(&ctx, Map::new()).await.unwrap();
        assert!(out.is_empty());
    }
}
