//! The reconciliation protocol: a pure function of (record, chain state,
//! storage state, tx receipts) that reconciles local progress against
//! authoritative external state before any irreversible step runs.
//!
//! Dispatch is by workflow type. Per-type rules are applied in strict
//! priority order — first match wins; absence of any match yields
//! `NO_CHANGE`. The reconciler performs read-only adapter calls only; it
//! never submits a transaction or uploads a blob.

use serde_json::{json, Value};

use crate::adapters::{
    AdapterError, ChainAdapter, EpochChainPredicates, ScoreChainPredicates, StorageAdapter,
    TxReceipt, TxStatus, WorkChainPredicates,
};
use crate::record::{Progress, WorkflowRecord, WorkflowType};
use crate::reliability::classify::is_already_done;

/// The action the engine must apply to a record. Applying an action
/// constructs a new record in memory (bumping `updated_at`, clearing
/// `step_attempts` on step changes, merging progress monotonically) and
/// persists it with the operations in [`crate::persistence::store`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    NoChange,
    AdvanceToStep {
        step: String,
        progress_updates: Progress,
    },
    UpdateProgress {
        updates: Progress,
    },
    ClearTxHashAndRetry {
        field: String,
    },
    Complete,
    Fail {
        reason: String,
    },
}

fn progress(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Progress {
    Progress::from_fields(fields.into_iter().map(|(k, v)| (k.to_string(), v)))
}

/// Reconciles a receipt for a pending, not-yet-confirmed tx against the
/// authoritative predicate, following the shared shape repeated across
/// §4.4.1/4.4.2/4.4.3: confirmed re-checks the predicate, reverted-with-
/// "already" is an idempotent COMPLETE, reverted otherwise FAILs, pending
/// is NO_CHANGE, not_found clears the hash.
async fn reconcile_pending_tx<F>(
    receipt: Option<TxReceipt>,
    tx_hash_field: &str,
    on_confirmed: F,
) -> ReconcileAction
where
    F: FnOnce() -> ReconcileAction,
{
    match receipt {
        None => ReconcileAction::ClearTxHashAndRetry {
            field: tx_hash_field.to_string(),
        },
        Some(receipt) => match receipt.status {
            TxStatus::Confirmed { .. } => on_confirmed(),
            TxStatus::Reverted { reason } => {
                let reason = reason.unwrap_or("reverted");
                if is_already_done(reason) {
                    ReconcileAction::Complete
                } else {
                    ReconcileAction::Fail {
                        reason: reason.to_string(),
                    }
                }
            }
            TxStatus::Pending => ReconcileAction::NoChange,
        },
    }
}

pub struct ReconcileContext<'a> {
    pub chain: &'a dyn ChainAdapter,
    pub storage: &'a dyn StorageAdapter,
    pub work_predicates: &'a dyn WorkChainPredicates,
    pub score_predicates: &'a dyn ScoreChainPredicates,
    pub epoch_predicates: &'a dyn EpochChainPredicates,
}

pub async fn reconcile(
    record: &WorkflowRecord,
    ctx: &ReconcileContext<'_>,
) -> Result<ReconcileAction, AdapterError> {
    match record.workflow_type {
        WorkflowType::WorkSubmission => reconcile_work_submission(record, ctx).await,
        WorkflowType::ScoreSubmission => reconcile_score_submission(record, ctx).await,
        WorkflowType::CloseEpoch => reconcile_close_epoch(record, ctx).await,
    }
}

fn field_str<'a>(record: &'a WorkflowRecord, key: &str) -> Option<&'a str> {
    record.progress.get(key).and_then(|v| v.as_str())
}

fn input_str<'a>(record: &'a WorkflowRecord, key: &str) -> &'a str {
    record
        .input
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

async fn reconcile_work_submission(
    record: &WorkflowRecord,
    ctx: &ReconcileContext<'_>,
) -> Result<ReconcileAction, AdapterError> {
    let studio = input_str(record, "studio");
    let epoch = input_str(record, "epoch");
    let data_hash = input_str(record, "data_hash");

    // Rule 1: secondary registration already confirmed on-chain.
    if ctx
        .work_predicates
        .work_already_registered(data_hash)
        .await?
    {
        return Ok(ReconcileAction::Complete);
    }

    // Rule 2: pending secondary-registration tx.
    if let Some(hash) = field_str(record, "registration_tx_hash") {
        if !record.progress.contains("registration_confirmed") {
            let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
            return Ok(match receipt {
                None => ReconcileAction::ClearTxHashAndRetry {
                    field: "registration_tx_hash".to_string(),
                },
                Some(receipt) => match receipt.status {
                    TxStatus::Confirmed { .. } => {
                        if ctx
                            .work_predicates
                            .work_already_registered(data_hash)
                            .await?
                        {
                            ReconcileAction::Complete
                        } else {
                            ReconcileAction::UpdateProgress {
                                updates: progress([("registration_confirmed", json!(true))]),
                            }
                        }
                    }
                    TxStatus::Reverted { reason } => {
                        let reason = reason.unwrap_or("reverted");
                        if is_already_done(reason) {
                            ReconcileAction::Complete
                        } else {
                            ReconcileAction::Fail {
                                reason: reason.to_string(),
                            }
                        }
                    }
                    TxStatus::Pending => ReconcileAction::NoChange,
                },
            });
        }
    }

    // Rule 3: primary ledger already holds the work while still on the
    // primary submit/confirm step — treats the predicate as already true
    // without waiting on the recorded tx hash at all.
    let on_submit_or_confirm = matches!(
        record.step.as_str(),
        "submit_onchain" | "await_onchain_confirmation"
    );
    if on_submit_or_confirm
        && ctx
            .work_predicates
            .work_exists_on_primary_ledger(data_hash)
            .await?
    {
        return Ok(ReconcileAction::AdvanceToStep {
            step: "register".to_string(),
            progress_updates: progress([
                ("onchain_confirmed", json!(true)),
                ("confirmed_at", json!(chrono::Utc::now())),
            ]),
        });
    }

    // Rule 4: pending primary-submit tx.
    if on_submit_or_confirm {
        if let Some(hash) = field_str(record, "onchain_tx_hash") {
            if !record.progress.contains("onchain_confirmed") {
                let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
                return Ok(match receipt {
                    None => ReconcileAction::ClearTxHashAndRetry {
                        field: "onchain_tx_hash".to_string(),
                    },
                    Some(receipt) => match receipt.status {
                        TxStatus::Confirmed { .. } => {
                            if ctx
                                .work_predicates
                                .work_exists_on_primary_ledger(data_hash)
                                .await?
                            {
                                ReconcileAction::AdvanceToStep {
                                    step: "register".to_string(),
                                    progress_updates: progress([(
                                        "onchain_confirmed",
                                        json!(true),
                                    )]),
                                }
                            } else {
                                ReconcileAction::Fail {
                                    reason: "tx confirmed but work not found".to_string(),
                                }
                            }
                        }
                        TxStatus::Reverted { reason } => ReconcileAction::Fail {
                            reason: reason.unwrap_or("reverted").to_string(),
                        },
                        TxStatus::Pending => ReconcileAction::NoChange,
                    },
                });
            }
        }
    }

    // Rule 5: storage confirmation catch-up.
    if let Some(id) = field_str(record, "storage_id") {
        if !record.progress.contains("storage_confirmed") {
            use crate::adapters::UploadStatus;
            if ctx.storage.status(id).await? == UploadStatus::Confirmed {
                return Ok(ReconcileAction::UpdateProgress {
                    updates: progress([("storage_confirmed", json!(true))]),
                });
            }
            return Ok(ReconcileAction::NoChange);
        }
    }

    let _ = studio;
    let _ = epoch;
    Ok(ReconcileAction::NoChange)
}

async fn reconcile_score_submission(
    record: &WorkflowRecord,
    ctx: &ReconcileContext<'_>,
) -> Result<ReconcileAction, AdapterError> {
    let signer = record.signer.as_str();
    let data_hash = input_str(record, "data_hash");
    let mode = input_str(record, "mode");

    if ctx.score_predicates.validator_registered(signer).await? {
        return Ok(ReconcileAction::Complete);
    }

    if let Some(hash) = field_str(record, "registration_tx_hash") {
        if !record.progress.contains("registration_confirmed") {
            let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
            return Ok(reconcile_pending_tx(receipt, "registration_tx_hash", || {
                ReconcileAction::UpdateProgress {
                    updates: progress([("registration_confirmed", json!(true))]),
                }
            })
            .await);
        }
    }

    if mode == "commit_reveal" {
        // Rule 3: reveal-exists predicate catch-up.
        if ctx
            .score_predicates
            .commitment_already_revealed(data_hash, signer)
            .await?
            && !record.progress.contains("reveal_confirmed")
        {
            return Ok(ReconcileAction::AdvanceToStep {
                step: "register_validator".to_string(),
                progress_updates: progress([("reveal_confirmed", json!(true))]),
            });
        }

        // Rule 4: pending reveal tx.
        if let Some(hash) = field_str(record, "reveal_tx_hash") {
            if !record.progress.contains("reveal_confirmed") {
                let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
                return Ok(reconcile_pending_tx(receipt, "reveal_tx_hash", || {
                    ReconcileAction::AdvanceToStep {
                        step: "register_validator".to_string(),
                        progress_updates: progress([("reveal_confirmed", json!(true))]),
                    }
                })
                .await);
            }
        }

        // Rule 5: commit-exists predicate catch-up. A commit landing
        // on-chain only confirms the commit step itself, not the reveal
        // that follows it, so this heals via UPDATE_PROGRESS rather than
        // an ADVANCE_TO_STEP.
        if ctx
            .score_predicates
            .commitment_exists(data_hash, signer)
            .await?
            && !record.progress.contains("commit_confirmed")
        {
            return Ok(ReconcileAction::UpdateProgress {
                updates: progress([("commit_confirmed", json!(true))]),
            });
        }

        // Rule 6: pending commit tx.
        if let Some(hash) = field_str(record, "commit_tx_hash") {
            if !record.progress.contains("commit_confirmed") {
                let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
                return Ok(reconcile_pending_tx(receipt, "commit_tx_hash", || {
                    ReconcileAction::UpdateProgress {
                        updates: progress([("commit_confirmed", json!(true))]),
                    }
                })
                .await);
            }
        }
    } else {
        // Rule 7: direct-score-existence predicate catch-up.
        if ctx
            .score_predicates
            .score_already_submitted(data_hash, signer)
            .await?
            && !record.progress.contains("score_confirmed")
        {
            return Ok(ReconcileAction::AdvanceToStep {
                step: "register_validator".to_string(),
                progress_updates: progress([("score_confirmed", json!(true))]),
            });
        }

        // Pending direct-score tx.
        if let Some(hash) = field_str(record, "score_tx_hash") {
            if !record.progress.contains("score_confirmed") {
                let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
                return Ok(reconcile_pending_tx(receipt, "score_tx_hash", || {
                    ReconcileAction::AdvanceToStep {
                        step: "register_validator".to_string(),
                        progress_updates: progress([("score_confirmed", json!(true))]),
                    }
                })
                .await);
            }
        }
    }

    Ok(ReconcileAction::NoChange)
}

async fn reconcile_close_epoch(
    record: &WorkflowRecord,
    ctx: &ReconcileContext<'_>,
) -> Result<ReconcileAction, AdapterError> {
    let epoch_id = input_str(record, "epoch");

    if ctx.epoch_predicates.epoch_already_closed(epoch_id).await? {
        return Ok(ReconcileAction::Complete);
    }

    if let Some(hash) = field_str(record, "close_tx_hash") {
        if !record.progress.contains("close_confirmed") {
            let receipt = ctx.chain.fetch_tx_receipt(hash).await?;
            return Ok(reconcile_pending_tx(receipt, "close_tx_hash", || {
                ReconcileAction::UpdateProgress {
                    updates: progress([("close_confirmed", json!(true))]),
                }
            })
            .await);
        }
    }

    Ok(ReconcileAction::NoChange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, SignedTxRequest, UploadStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockChain {
        receipts: Mutex<std::collections::HashMap<String, TxReceipt>>,
    }

    #[async_trait]
    impl ChainAdapter for MockChain {
        async fn fetch_nonce(&self, _signer: &str) -> Result<u64, AdapterError> {
            Ok(0)
        }
        async fn submit_signed_tx(
            &self,
            _signer: &str,
            _req: SignedTxRequest,
        ) -> Result<String, AdapterError> {
            Ok("0xdead".to_string())
        }
        async fn fetch_tx_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, AdapterError> {
            Ok(self.receipts.lock().unwrap().get(tx_hash).cloned())
        }
        async fn wait_for_confirmation(
            &self,
            tx_hash: &str,
            _min_confirmations: u64,
        ) -> Result<TxReceipt, AdapterError> {
            self.fetch_tx_receipt(tx_hash)
                .await?
                .ok_or(AdapterError::Chain("not found".into()))
        }
    }

    #[derive(Default)]
    struct MockStorage {
        status: Mutex<Option<UploadStatus>>,
    }

    #[async_trait]
    impl StorageAdapter for MockStorage {
        async fn upload(&self, _bytes: Vec<u8>, _tags: Value) -> Result<String, AdapterError> {
            Ok("u1".to_string())
        }
        async fn status(&self, _id: &str) -> Result<UploadStatus, AdapterError> {
            Ok(self.status.lock().unwrap().unwrap_or(UploadStatus::Pending))
        }
    }

    #[derive(Default)]
    struct MockWork {
        registered: Mutex<bool>,
        primary_exists: Mutex<bool>,
    }

    #[async_trait]
    impl WorkChainPredicates for MockWork {
        async fn work_already_registered(&self, _data_hash: &str) -> Result<bool, AdapterError> {
            Ok(*self.registered.lock().unwrap())
        }
        async fn work_exists_on_primary_ledger(
            &self,
            _data_hash: &str,
        ) -> Result<bool, AdapterError> {
            Ok(*self.primary_exists.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct MockScore;
    #[async_trait]
    impl ScoreChainPredicates for MockScore {
        async fn validator_registered(&self, _signer: &str) -> Result<bool, AdapterError> {
            Ok(false)
        }
        async fn score_already_submitted(
            &self,
            _data_hash: &str,
            _signer: &str,
        ) -> Result<bool, AdapterError> {
            Ok(false)
        }
        async fn commitment_exists(
            &self,
            _data_hash: &str,
            _signer: &str,
        ) -> Result<bool, AdapterError> {
            Ok(false)
        }
        async fn commitment_already_revealed(
            &self,
            _data_hash: &str,
            _signer: &str,
        ) -> Result<bool, AdapterError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct MockEpoch {
        closed: Mutex<bool>,
    }
    #[async_trait]
    impl EpochChainPredicates for MockEpoch {
        async fn epoch_already_closed(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(*self.closed.lock().unwrap())
        }
        async fn epoch_ready_to_close(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn close_epoch_already_closed_completes_without_tx() {
        let chain = MockChain::default();
        let storage = MockStorage::default();
        let work = MockWork::default();
        let score = MockScore;
        let epoch = MockEpoch {
            closed: Mutex::new(true),
        };
        let ctx = ReconcileContext {
            chain: &chain,
            storage: &storage,
            work_predicates: &work,
            score_predicates: &score,
            epoch_predicates: &epoch,
        };

        let record = WorkflowRecord::new(
            WorkflowType::CloseEpoch,
            json!({"epoch": "1"}),
            "0xsigner",
            "check_preconditions",
        );
        let action = reconcile(&record, &ctx).await.unwrap();
        assert_eq!(action, ReconcileAction::Complete);
    }

    #[tokio::test]
    async fn work_submission_not_found_clears_tx_hash() {
        let chain = MockChain::default();
        let storage = MockStorage::default();
        let work = MockWork::default();
        let score = MockScore;
        let epoch = MockEpoch::default();
        let ctx = ReconcileContext {
            chain: &chain,
            storage: &storage,
            work_predicates: &work,
            score_predicates: &score,
            epoch_predicates: &epoch,
        };

        let mut record = WorkflowRecord::new(
            WorkflowType::WorkSubmission,
            json!({"studio": "s", "epoch": "1", "data_hash": "h"}),
            "0xsigner",
            "await_onchain_confirmation",
        );
        record.progress = Progress::from_fields([("onchain_tx_hash".to_string(), json!("0xabc"))]);

        let action = reconcile(&record, &ctx).await.unwrap();
        assert_eq!(
            action,
            ReconcileAction::ClearTxHashAndRetry {
                field: "onchain_tx_hash".to_string()
            }
        );
    }
}
