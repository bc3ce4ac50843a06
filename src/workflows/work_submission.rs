//! WorkSubmission: 7-step pipeline — compute roots, upload evidence,
//! await storage confirmation, submit on-chain, await on-chain
//! confirmation, register in secondary ledger, await registration
//! confirmation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapters::{AdapterError, SignedTxRequest, TxStatus, UploadStatus};
use crate::engine::registry::WorkflowDefinition;
use crate::record::{Progress, WorkflowRecord};
use crate::reliability::classify::is_already_done;
use crate::reliability::timeout::budget_exceeded;
use crate::step::{ClassifiedError, Step, StepContext, StepOutcome};

use super::roots::{compute_derivation_roots, EvidencePackage};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_CONFIRMATIONS: u64 = 1;

fn admin_or_signer(record: &WorkflowRecord) -> String {
    record
        .input
        .get("admin_signer")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| record.signer.clone())
}

fn evidence_from_input(record: &WorkflowRecord) -> Vec<EvidencePackage> {
    record
        .input
        .get("evidence")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| serde_json::from_value::<EvidencePackage>(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

struct ComputeRootsStep;

#[async_trait]
impl Step for ComputeRootsStep {
    fn is_irreversible(&self) -> bool {
        false
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("thread_root") {
            return StepOutcome::Success {
                next_step: "upload_evidence".to_string(),
            };
        }
        let evidence = evidence_from_input(record);
        let roots = compute_derivation_roots(&evidence);
        let update = Progress::from_fields([
            ("thread_root".to_string(), json!(roots.thread_root)),
            ("evidence_root".to_string(), json!(roots.evidence_root)),
            ("agent_weights".to_string(), json!(roots.agent_weights)),
        ]);
        if let Err(e) = ctx.store.append_progress(record.id, update).await {
            return StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            };
        }
        StepOutcome::Success {
            next_step: "upload_evidence".to_string(),
        }
    }
}

struct UploadEvidenceStep;

#[async_trait]
impl Step for UploadEvidenceStep {
    fn is_irreversible(&self) -> bool {
        false
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("storage_id") {
            return StepOutcome::Success {
                next_step: "await_storage_confirmation".to_string(),
            };
        }
        let studio = record.input.get("studio").cloned().unwrap_or(Value::Null);
        let epoch = record.input.get("epoch").cloned().unwrap_or(Value::Null);
        let agent = record.input.get("agent").cloned().unwrap_or(Value::Null);
        let data_hash = record
            .input
            .get("data_hash")
            .cloned()
            .unwrap_or(Value::Null);
        let tags =
            json!({"studio": studio, "epoch": epoch, "agent": agent, "data_hash": data_hash});
        let bytes = record
            .input
            .get("evidence_bytes")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|n| n.as_u64().map(|n| n as u8))
                    .collect()
            })
            .unwrap_or_default();

        match ctx.storage.upload(bytes, tags).await {
            Ok(id) => {
                let update = Progress::from_fields([("storage_id".to_string(), json!(id))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: "await_storage_confirmation".to_string(),
                }
            }
            Err(AdapterError::Storage(msg)) | Err(AdapterError::Chain(msg)) => StepOutcome::Retry {
                error: ClassifiedError::from_message(msg),
            },
        }
    }
}

struct AwaitStorageConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitStorageConfirmationStep {
    fn is_irreversible(&self) -> bool {
        false
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("storage_confirmed") {
            return StepOutcome::Success {
                next_step: "submit_onchain".to_string(),
            };
        }
        let Some(id) = record
            .progress
            .get("storage_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message(
                    "missing storage_id at await_storage_confirmation",
                ),
            };
        };

        let started_at = match record
            .progress
            .get("storage_wait_started_at")
            .and_then(|v| v.as_str())
        {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
            None => {
                let now = chrono::Utc::now();
                let _ = ctx
                    .store
                    .append_progress(
                        record.id,
                        Progress::from_fields([(
                            "storage_wait_started_at".to_string(),
                            json!(now.to_rfc3339()),
                        )]),
                    )
                    .await;
                now
            }
        };

        match ctx.storage.status(&id).await {
            Ok(UploadStatus::Confirmed) => {
                let update =
                    Progress::from_fields([("storage_confirmed".to_string(), json!(true))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: "submit_onchain".to_string(),
                }
            }
            Ok(UploadStatus::Pending) | Ok(UploadStatus::NotFound) => {
                if budget_exceeded(started_at, self.budget) {
                    StepOutcome::Stalled {
                        reason: "storage confirmation budget exceeded".to_string(),
                    }
                } else {
                    StepOutcome::Retry {
                        error: ClassifiedError {
                            category: crate::reliability::ErrorCategory::Transient,
                            message: "storage upload still pending".to_string(),
                            code: None,
                        },
                    }
                }
            }
            Err(AdapterError::Storage(msg)) | Err(AdapterError::Chain(msg)) => StepOutcome::Retry {
                error: ClassifiedError::from_message(msg),
            },
        }
    }
}

struct SubmitOnchainStep;

#[async_trait]
impl Step for SubmitOnchainStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("onchain_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_onchain_confirmation".to_string(),
            };
        }
        if !record.progress.contains("thread_root")
            || !record.progress.contains("storage_confirmed")
        {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message(
                    "preconditions not met: roots and storage confirmation required",
                ),
            };
        }

        let data_hash = record
            .input
            .get("data_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let req = SignedTxRequest {
            to: "work_registry".to_string(),
            data: data_hash.as_bytes().to_vec(),
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
                let update = Progress::from_fields([("onchain_tx_hash".to_string(), json!(hash))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: "await_onchain_confirmation".to_string(),
                }
            }
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

struct AwaitOnchainConfirmationStep {
    budget: Duration,
}

#[async_trait]
impl Step for AwaitOnchainConfirmationStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("onchain_confirmed") {
            return StepOutcome::Success {
                next_step: "register".to_string(),
            };
        }
        let Some(hash) = record
            .progress
            .get("onchain_tx_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message(
                    "missing onchain_tx_hash at await_onchain_confirmation",
                ),
            };
        };

        match ctx
            .signer_queue
            .check_tx_status(ctx.chain.as_ref(), &hash)
            .await
        {
            Ok(Some(receipt)) => match receipt.status {
                TxStatus::Confirmed { block_number } => {
                    ctx.signer_queue
                        .release_signer_lock(&record.signer, record.id);
                    let update = Progress::from_fields([
                        ("onchain_confirmed".to_string(), json!(true)),
                        ("onchain_block".to_string(), json!(block_number)),
                    ]);
                    if let Err(e) = ctx.store.append_progress(record.id, update).await {
                        return StepOutcome::Retry {
                            error: ClassifiedError::from_message(e.to_string()),
                        };
                    }
                    StepOutcome::Success {
                        next_step: "register".to_string(),
                    }
                }
                TxStatus::Reverted { reason } => {
                    ctx.signer_queue
                        .release_signer_lock(&record.signer, record.id);
                    StepOutcome::Failed {
                        error: ClassifiedError::from_message(reason.unwrap_or("reverted")),
                    }
                }
                TxStatus::Pending => {
                    if budget_exceeded(record.created_at, self.budget) {
                        StepOutcome::Stalled {
                            reason: "on-chain confirmation budget exceeded".to_string(),
                        }
                    } else {
                        StepOutcome::Retry {
                            error: ClassifiedError {
                                category: crate::reliability::ErrorCategory::Transient,
                                message: "tx pending confirmation".to_string(),
                                code: None,
                            },
                        }
                    }
                }
            },
            Ok(None) => StepOutcome::Stalled {
                reason: "submitted tx not found; awaiting reconciliation".to_string(),
            },
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

struct RegisterStep;

#[async_trait]
impl Step for RegisterStep {
    fn is_irreversible(&self) -> bool {
        true
    }

    async fn execute(&self, record: &WorkflowRecord, ctx: &StepContext) -> StepOutcome {
        if record.progress.contains("registration_tx_hash") {
            return StepOutcome::Success {
                next_step: "await_registration_confirmation".to_string(),
            };
        }
        let signer = admin_or_signer(record);
        let data_hash = record
            .input
            .get("data_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let req = SignedTxRequest {
            to: "secondary_ledger".to_string(),
            data: data_hash.as_bytes().to_vec(),
            value: None,
            nonce: 0,
        };

        match ctx
            .signer_queue
            .submit_only(ctx.chain.as_ref(), &signer, record.id, req, LOCK_TIMEOUT)
            .await
        {
            Ok(hash) => {
                let update =
                    Progress::from_fields([("registration_tx_hash".to_string(), json!(hash))]);
                if let Err(e) = ctx.store.append_progress(record.id, update).await {
                    return StepOutcome::Retry {
                        error: ClassifiedError::from_message(e.to_string()),
                    };
                }
                StepOutcome::Success {
                    next_step: "await_registration_confirmation".to_string(),
                }
            }
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
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
        let Some(hash) = record
            .progress
            .get("registration_tx_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return StepOutcome::Failed {
                error: ClassifiedError::from_message("missing registration_tx_hash"),
            };
        };
        let signer = admin_or_signer(record);

        match ctx
            .signer_queue
            .check_tx_status(ctx.chain.as_ref(), &hash)
            .await
        {
            Ok(Some(receipt)) => match receipt.status {
                TxStatus::Confirmed { .. } => {
                    ctx.signer_queue.release_signer_lock(&signer, record.id);
                    let update = Progress::from_fields([(
                        "registration_confirmed".to_string(),
                        json!(true),
                    )]);
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
                    ctx.signer_queue.release_signer_lock(&signer, record.id);
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
                            reason: "registration confirmation budget exceeded".to_string(),
                        }
                    } else {
                        StepOutcome::Retry {
                            error: ClassifiedError {
                                category: crate::reliability::ErrorCategory::Transient,
                                message: "registration tx pending".to_string(),
                                code: None,
                            },
                        }
                    }
                }
            },
            Ok(None) => StepOutcome::Stalled {
                reason: "registration tx not found; awaiting reconciliation".to_string(),
            },
            Err(e) => StepOutcome::Retry {
                error: ClassifiedError::from_message(e.to_string()),
            },
        }
    }
}

pub struct WorkSubmissionDefinition {
    compute_roots: ComputeRootsStep,
    upload_evidence: UploadEvidenceStep,
    await_storage_confirmation: AwaitStorageConfirmationStep,
    submit_onchain: SubmitOnchainStep,
    await_onchain_confirmation: AwaitOnchainConfirmationStep,
    register: RegisterStep,
    await_registration_confirmation: AwaitRegistrationConfirmationStep,
}

impl WorkSubmissionDefinition {
    pub fn new(storage_confirm_budget: Duration, tx_confirm_budget: Duration) -> Self {
        Self {
            compute_roots: ComputeRootsStep,
            upload_evidence: UploadEvidenceStep,
            await_storage_confirmation: AwaitStorageConfirmationStep {
                budget: storage_confirm_budget,
            },
            submit_onchain: SubmitOnchainStep,
            await_onchain_confirmation: AwaitOnchainConfirmationStep {
                budget: tx_confirm_budget,
            },
            register: RegisterStep,
            await_registration_confirmation: AwaitRegistrationConfirmationStep {
                budget: tx_confirm_budget,
            },
        }
    }
}

impl WorkflowDefinition for WorkSubmissionDefinition {
    fn initial_step(&self, _input: &Value) -> String {
        "compute_roots".to_string()
    }

    fn step(&self, name: &str) -> Option<&dyn Step> {
        match name {
            "compute_roots" => Some(&self.compute_roots),
            "upload_evidence" => Some(&self.upload_evidence),
            "await_storage_confirmation" => Some(&self.await_storage_confirmation),
            "submit_onchain" => Some(&self.submit_onchain),
            "await_onchain_confirmation" => Some(&self.await_onchain_confirmation),
            "register" => Some(&self.register),
            "await_registration_confirmation" => Some(&self.await_registration_confirmation),
            _ => None,
        }
    }
}

pub fn min_confirmations() -> u64 {
    MIN_CONFIRMATIONS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::*;
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use crate::record::WorkflowType;
    use crate::txqueue::SignerQueue;
    use std::sync::Arc;

    struct FakeStorage;
    #[async_trait]
    impl StorageAdapter for FakeStorage {
        async fn upload(&self, _bytes: Vec<u8>, _tags: Value) -> Result<String, AdapterError> {
            Ok("u1".to_string())
        }
        async fn status(&self, _id: &str) -> Result<UploadStatus, AdapterError> {
            Ok(UploadStatus::Confirmed)
        }
    }

    struct FakeChain;
    #[async_trait]
    impl ChainAdapter for FakeChain {
        async fn fetch_nonce(&self, _signer: &str) -> Result<u64, AdapterError> {
            Ok(1)
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
            Ok(Some(TxReceipt {
                status: TxStatus::Confirmed { block_number: 100 },
                block_number: Some(100),
                revert_reason: None,
            }))
        }
        async fn wait_for_confirmation(
            &self,
            tx_hash: &str,
            _n: u64,
        ) -> Result<TxReceipt, AdapterError> {
            Ok(self.fetch_tx_receipt(tx_hash).await?.unwrap_or(TxReceipt {
                status: TxStatus::Pending,
                block_number: None,
                revert_reason: None,
            }))
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

    fn ctx() -> StepContext {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        StepContext {
            chain: Arc::new(FakeChain),
            storage: Arc::new(FakeStorage),
            signer_queue: SignerQueue::new(),
            store,
            epoch_predicates: Arc::new(NoopEpoch),
        }
    }

    #[tokio::test]
    async fn compute_roots_is_idempotent_on_retry() {
        let step = ComputeRootsStep;
        let mut record = WorkflowRecord::new(
            WorkflowType::WorkSubmission,
            json!({"studio": "s", "epoch": "1", "agent": "a", "data_hash": "h", "evidence": []}),
            "0xsigner",
            "compute_roots",
        );
        let ctx = ctx();
        ctx.store.create(record.clone()).await.unwrap();
        let outcome = step.execute(&record, &ctx).await;
        assert!(matches!(outcome, StepOutcome::Success { .. }));
        record = ctx.store.load(record.id).await.unwrap();
        assert!(record.progress.contains("thread_root"));

        // Second call must short-circuit without recomputation error.
        let outcome2 = step.execute(&record, &ctx).await;
        assert!(
            matches!(outcome2, StepOutcome::Success { next_step } if next_step == "upload_evidence")
        );
    }

    #[tokio::test]
    async fn submit_onchain_requires_preconditions() {
        let step = SubmitOnchainStep;
        let record = WorkflowRecord::new(
            WorkflowType::WorkSubmission,
            json!({"data_hash": "h"}),
            "0xsigner",
            "submit_onchain",
        );
        let ctx = ctx();
        let outcome = step.execute(&record, &ctx).await;
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }
}
