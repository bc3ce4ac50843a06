//! ScoreSubmission: two pipelines sharing a `register_validator` tail.
//!
//! `direct` mode submits a score transaction then registers. `commit_reveal`
//! mode commits a hash, reveals it once the window opens, then registers.
//! The initial step is chosen from `input.mode`.

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

async fn submit_tx(
    ctx: &StepContext,
    record: &WorkflowRecord,
    to: &str,
    data: &[u8],
    progress_key: &str,
    next_step: &str,
) -> StepOutcome {
    let req = SignedTxRequest {
        to: to.to_string(),
        data: data.to_vec(),
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
            let update = Progress::from_fields([(progress_key.to_string(), json!(hash))]);
            if let Err(e) = ctx.store.append_progress(record.id, update).await {
                return StepOutcome::Retry {
                    error: ClassifiedError::from_message(e.to_string()),
                };
            }
            StepOutcome::Success {
                next_step: next_step.to_string(),
            }
        }
        Err(e) => StepOutcome::Retry {
            error: ClassifiedError::from_message(e.to_string()),
        },
    }
}

async fn await_tx(
    ctx: &StepContext,
    record: &WorkflowRecord,
    hash_key: &str,
    confirmed_key: &str,
    not_found_reason: &str,
    budget: Duration,
    next_step: &str,
) -> StepOutcome {
    let Some(hash) = record
        .progress
        .get(hash_key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        return StepOutcome::Failed {
            error: ClassifiedError::from_message(format!("missing {hash_key}")),
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
                let update = Progress::from_fields([(confirmed_key.to_string(), json!(true))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: next_step.to_string(),
                }
            }
            TxStatus::Reverted { reason } => {
                ctx.signer_queue
                    .release_signer_lock(&record.signer, record.id);
                let reason = reason.unwrap_or("reverted");
                if is_already_done(reason) {
                    StepOutcome::Success {
                        next_step: next_step.to_string(),
                    }
                } else {
                    StepOutcome::Failed {
                        error: ClassifiedError::from_message(reason),
                    }
                }
            }
            TxStatus::Pending => {
                if budget_exceeded(record.created_at, budget) {
                    StepOutcome::Stalled {
                        reason: format!("{confirmed_key} budget exceeded"),
                    }
                } else {
                    StepOutcome::Retry {
                        error: ClassifiedError {
                            category: crate::reliability::ErrorCategory::Transient,
                            message: "tx pending".to_string(),
                            code: None,
                        },
                    }
                }
            }
        },
        Ok(None) => StepOutcome::Stalled {
            reason: not_found_reason.to_string(),
        },
        Err(e) => StepOutcome::Retry {
            error: ClassifiedError::from_message(e.to_string()),
        },
    }
}

struct SubmitScoreStep;

#[async_trait]
impl Step for SubmitScoreStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("score_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_score_confirmation".to_string(),
            };
        }
        let data_hash = record
            .input
            .get("data_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        submit_tx(
            ctx,
            record,
            "score_registry",
            data_hash.as_bytes(),
            "score_tx_hash",
            "await_score_confirmation",
        )
        .await
    }
}

struct AwaitScoreConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitScoreConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("score_confirmed") {
            return StepOutcome::Success {
                next_step: "register_validator".to_string(),
            };
        }
        await_tx(
            ctx,
            record,
            "score_tx_hash",
            "score_confirmed",
            "score tx not found; awaiting reconciliation",
            self.budget,
            "register_validator",
        )
        .await
    }
}

struct CommitStep;

#[async_trait]
impl Step for CommitStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("commit_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_commit_confirmation".to_string(),
            };
        }
        let commitment = record
            .input
            .get("commitment")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        submit_tx(
            ctx,
            record,
            "score_registry",
            commitment.as_bytes(),
            "commit_tx_hash",
            "await_commit_confirmation",
        )
        .await
    }
}

struct AwaitCommitConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitCommitConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("commit_confirmed") {
            return StepOutcome::Success {
                next_step: "reveal".to_string(),
            };
        }
        await_tx(
            ctx,
            record,
            "commit_tx_hash",
            "commit_confirmed",
            "commit tx not found; awaiting reconciliation",
            self.budget,
            "reveal",
        )
        .await
    }
}

struct RevealStep;

#[async_trait]
impl Step for RevealStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("reveal_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_reveal_confirmation".to_string(),
            };
        }
        if !record.progress.contains("commit_confirmed") {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message("reveal attempted before commit confirmation"),
            };
        }
        let data_hash = record
            .input
            .get("data_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        submit_tx(
            ctx,
            record,
            "score_registry",
            data_hash.as_bytes(),
            "reveal_tx_hash",
            "await_reveal_confirmation",
        )
        .await
    }
}

struct AwaitRevealConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitRevealConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("reveal_confirmed") {
            return StepOutcome::Success {
                next_step: "register_validator".to_string(),
            };
        }
        await_tx(
            ctx,
            record,
            "reveal_tx_hash",
            "reveal_confirmed",
            "reveal tx not found; awaiting reconciliation",
            self.budget,
            "register_validator",
        )
        .await
    }
}

struct RegisterValidatorStep;

#[async_trait]
impl Step for RegisterValidatorStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("registration_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_registration_confirmation".to_string(),
            };
        }
        let signer = record.signer.as_str();
        submit_tx(
            ctx,
            record,
            "validator_registry",
            signer.as_bytes(),
            "registration_tx_hash",
            "await_registration_confirmation",
        )
        .await
    }
}

struct AwaitRegistrationConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitRegistrationConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("registration_confirmed") {
            return StepOutcome::Success {
                next_step: "COMPLETED".to_string(),
            };
        }
        await_tx(
            ctx,
            record,
            "registration_tx_hash",
            "registration_confirmed",
            "registration tx not found; awaiting reconciliation",
            self.budget,
            "COMPLETED",
        )
        .await
    }
}

pub struct ScoreSubmissionDefinition {
    submit_score: SubmitScoreStep,
    await_score_confirmation: AwaitScoreConfirmationStep,
    commit: CommitStep,
    await_commit_confirmation: AwaitCommitConfirmationStep,
    reveal: RevealStep,
    await_reveal_confirmation: AwaitRevealConfirmationStep,
    register_validator: RegisterValidatorStep,
    await_registration_confirmation: AwaitRegistrationConfirmationStep,
}

impl ScoreSubmissionDefinition {
    pub fn new(tx_confirm_budget: Duration) -> Self {
        Self {
            submit_score: SubmitScoreStep,
            await_score_confirmation: AwaitScoreConfirmationStep {
                budget: tx_confirm_budget,
            },
            commit: CommitStep,
            await_commit_confirmation: AwaitCommitConfirmationStep {
                budget: tx_confirm_budget,
            },
            reveal: RevealStep,
            await_reveal_confirmation: AwaitRevealConfirmationStep {
                budget: tx_confirm_budget,
            },
            register_validator: RegisterValidatorStep,
            await_registration_confirmation: AwaitRegistrationConfirmationStep {
                budget: tx_confirm_budget,
            },
        }
    }
}

impl WorkflowDefinition for ScoreSubmissionDefinition {
    fn initial_step(&self, input: &Value) -> String {
        if input.get("mode").and_then(|v| v.as_str()) == Some("commit_reveal") {
            "commit".to_string()
        } else {
            "submit_score".to_string()
        }
    }

    fn step(&self, name: &str) -> Option<&dyn Step> {
        match name {
            "submit_score" => Some(&self.submit_score),
            "await_score_confirmation" => Some(&self.await_score_confirmation),
            "commit" => Some(&self.commit),
            "await_commit_confirmation" => Some(&self.await_commit_confirmation),
            "reveal" => Some(&self.reveal),
            "await_reveal_confirmation" => Some(&self.await_reveal_confirmation),
            "register_validator" => Some(&self.register_validator),
            "await_registration_confirmation" => Some(&self.await_registration_confirmation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, ChainAdapter, StorageAdapter, TxReceipt, UploadStatus};
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use crate::record::WorkflowType;
    use crate::txqueue::SignerQueue;
    use std::sync::Arc;

    struct NoopChain;
    #[async_trait]
    impl ChainAdapter for NoopChain {
        async fn fetch_nonce(&self, _signer: &str) -> Result<u64, AdapterError> {
            Ok(0)
        }
        async fn submit_signed_tx(
            &self,
            _signer: &str,
            _req: SignedTxRequest,
        ) -> Result<String, AdapterError> {
            Ok("0xtx".to_string())
        }
        async fn fetch_tx_receipt(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TxReceipt>, AdapterError> {
            Ok(None)
        }
        async fn wait_for_confirmation(
            &self,
            _tx_hash: &str,
            _n: u64,
        ) -> Result<TxReceipt, AdapterError> {
            Err(AdapterError::Chain("not implemented".to_string()))
        }
    }

    struct NoopStorage;
    #[async_trait]
    impl StorageAdapter for NoopStorage {
        async fn upload(&self, _bytes: Vec<u8>, _tags: Value) -> Result<String, AdapterError> {
            Ok("u1".to_string())
        }
        async fn status(&self, _id: &str) -> Result<UploadStatus, AdapterError> {
            Ok(UploadStatus::Pending)
        }
    }

    struct NoopEpoch;
    #[async_trait]
    impl crate::adapters::EpochChainPredicates for NoopEpoch {
        async fn epoch_already_closed(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(false)
        }
        async fn epoch_ready_to_close(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(true)
        }
    }

    #[test]
    fn initial_step_follows_mode() {
        let def = ScoreSubmissionDefinition::new(Duration::from_secs(60));
        assert_eq!(def.initial_step(&json!({"mode": "direct"})), "submit_score");
        assert_eq!(
            def.initial_step(&json!({"mode": "commit_reveal"})),
            "commit"
        );
    }

    #[tokio::test]
    async fn reveal_before_commit_confirmation_fails() {
        let step = RevealStep;
        let record = WorkflowRecord::new(
            WorkflowType::ScoreSubmission,
            json!({"mode": "commit_reveal", "data_hash": "h"}),
            "0xsigner",
            "reveal",
        );
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        let ctx = StepContext {
            chain: Arc::new(NoopChain),
            storage: Arc::new(NoopStorage),
            signer_queue: SignerQueue::new(),
            store,
            epoch_predicates: Arc::new(NoopEpoch),
        };
        let outcome = step.execute(&record, &ctx).await;
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }
}
