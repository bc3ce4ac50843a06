//! The step-executor contract every workflow step implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::{ChainAdapter, EpochChainPredicates, StorageAdapter};
use crate::persistence::WorkflowStore;
use crate::record::WorkflowRecord;
use crate::reliability::classify::{classify, ErrorCategory};
use crate::txqueue::SignerQueue;

/// A classified failure, carrying the category the engine routes on and
/// the raw message for logging/user display.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub code: Option<String>,
}

impl ClassifiedError {
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = classify(&message);
        Self {
            category,
            message,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Result of one invocation of a step's `execute`.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success { next_step: String },
    Retry { error: ClassifiedError },
    Stalled { reason: String },
    Failed { error: ClassifiedError },
}

/// Collaborators shared by every step, bundled the way the teacher's
/// `ActivityContext` bundles attempt/heartbeat state for an `Activity`.
pub struct StepContext {
    pub chain: Arc<dyn ChainAdapter>,
    pub storage: Arc<dyn StorageAdapter>,
    pub signer_queue: SignerQueue,
    /// Steps persist their own progress (e.g. a submitted tx hash) via
    /// this handle *before* returning, satisfying the write-ahead
    /// invariant from within `execute` itself.
    pub store: Arc<dyn WorkflowStore>,
    /// Consulted by `CloseEpoch`'s precondition step, which runs before
    /// the reconciler ever sees the record (the step is not irreversible).
    pub epoch_predicates: Arc<dyn EpochChainPredicates>,
}

/// One named, potentially-irreversible unit of work within a workflow
/// pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    /// Steps that submit on-chain transactions or upload content are
    /// irreversible: the engine reconciles before invoking them.
    fn is_irreversible(&self) -> bool;

    /// Must inspect `record.progress` at the top and short-circuit to
    /// `Success` if this step's side effect is already recorded, so a
    /// retried or resumed call never re-executes a completed effect.
    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome;
}
