//! CloseEpoch: a 3-step pipeline — check preconditions, submit the close
//! transaction, await its confirmation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapters::{SignedTxRequest, TxStatus};
use crate::engine::registry::WorkflowDefinition;
use crate::record::{Progress, WorkflowRecord};
use crate::reliability::classify::is_already_done;
use crate::reliability::timeout::budget_exceeded;
use crate::step::{ClassifiedError, Step, StepContext, StepOutcome};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

struct CheckPreconditionsStep;

#[async_trait]
impl Step for CheckPreconditionsStep {
    fn is_irreversible(&self) -> bool {
        false
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        let epoch = record.input.get("epoch").and_then(|v| v.as_str());
        let Some(epoch) = epoch.filter(|e| !e.is_empty()) else {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message("missing epoch in input"),
            };
        };

        match ctx.epoch_predicates.epoch_ready_to_close(epoch).await {
            Ok(true) => StepOutcome::Success {
                next_step: "submit_close".to_string(),
            },
            Ok(false) => StepOutcome::Stalled {
                reason: "epoch not yet ready to close".to_string(),
            },
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

struct SubmitCloseStep;

#[async_trait]
impl Step for SubmitCloseStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("close_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_close_confirmation".to_string(),
            };
        }
        let epoch = record
            .input
            .get("epoch")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let req = SignedTxRequest {
            to: "epoch_registry".to_string(),
            data: epoch.as_bytes().to_vec(),
            value: None,
            nonce: 0,
        };

        match ctx
            .signer_queue
            .submit_only(
                ctx.chain.as_ref(),
                &record.signer,
                record.id,
                req,
                LOCK_TIMEOUT,
            )
            .await
        {
            Ok(hash) => {
                let update = Progress::from_fields([("close_tx_hash".to_string(), json!(hash))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: "await_close_confirmation".to_string(),
                }
            }
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

struct AwaitCloseConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitCloseConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("close_confirmed") {
            return StepOutcome::Success {
                next_step: "COMPLETED".to_string(),
            };
        }
        let Some(hash) = record
            .progress
            .get("close_tx_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message("missing close_tx_hash"),
            };
        };

        match ctx
            .signer_queue
            .check_tx_status(ctx.chain.as_ref(), &hash)
            .await
        {
            Ok(Some(receipt)) => match receipt.status {
                TxStatus::Confirmed { .. } => {
                    ctx.signer_queue
                        .release_signer_lock(&record.signer, record.id);
                    let update =
                        Progress::from_fields([("close_confirmed".to_string(), json!(true))]);
                    if let Err(e) = ctx.store.append_progress(record.id, update).await {
                        return StepOutcome::Retry {
                            error: ClassifiedError::from_message(e.to_string()),
                        };
                    }
                    StepOutcome::Success {
                        next_step: "COMPLETED".to_string(),
                    }
                }
                TxStatus::Reverted { reason } => {
                    ctx.signer_queue
                        .release_signer_lock(&record.signer, record.id);
                    let reason = reason.unwrap_or("reverted");
                    if is_already_done(reason) {
                        StepOutcome::Success {
                            next_step: "COMPLETED".to_string(),
                        }
                    } else {
                        StepOutcome::Failed {
                            error: ClassifiedError::from_message(reason),
                        }
                    }
                }
                TxStatus::Pending => {
                    if budget_exceeded(record.created_at, self.budget) {
                        StepOutcome::Stalled {
                            reason: "close confirmation budget exceeded".to_string(),
                        }
                    } else {
                        StepOutcome::Retry {
                            error: ClassifiedError {
                                category: crate::reliability::ErrorCategory::Transient,
                                message: "close tx pending".to_string(),
                                code: None,
                            },
                        }
                    }
                }
            },
            Ok(None) => StepOutcome::Stalled {
                reason: "close tx not found; awaiting reconciliation".to_string(),
            },
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

pub struct CloseEpochDefinition {
    check_preconditions: CheckPreconditionsStep,
    submit_close: SubmitCloseStep,
    await_close_confirmation: AwaitCloseConfirmationStep,
}

impl CloseEpochDefinition {
    pub fn new(tx_confirm_budget: Duration) -> Self {
        Self {
            check_preconditions: CheckPreconditionsStep,
            submit_close: SubmitCloseStep,
            await_close_confirmation: AwaitCloseConfirmationStep {
                budget: tx_confirm_budget,
            },
        }
    }
}

impl WorkflowDefinition for CloseEpochDefinition {
    fn initial_step(&self, _input: &Value) -> String {
        "check_preconditions".to_string()
    }

    fn step(&self, name: &str) -> Option<&dyn Step> {
        match name {
            "check_preconditions" => Some(&self.check_preconditions),
            "submit_close" => Some(&self.submit_close),
            "await_close_confirmation" => Some(&self.await_close_confirmation),
            _ => None,
        }
    }
}
