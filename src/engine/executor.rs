//! The `WorkflowEngine` driver loop: loads a record, reconciles before
//! irreversible steps, executes the current step, persists the
//! translated transition, and emits events.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    ChainAdapter, EpochChainPredicates, ScoreChainPredicates, StorageAdapter, WorkChainPredicates,
};
use crate::config::EngineConfig;
use crate::persistence::{StoreError, WorkflowStore};
use crate::reconciler::{reconcile, ReconcileAction, ReconcileContext};
use crate::record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};
use crate::step::{StepContext, StepOutcome};
use crate::txqueue::SignerQueue;

use super::events::{EngineEvent, EventSink};
use super::registry::{RegistryError, WorkflowRegistry};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Adapter(#[from] crate::adapters::AdapterError),

    #[error("workflow {0} is already terminal")]
    AlreadyTerminal(Uuid),

    #[error("workflow {0} is already being driven")]
    AlreadyRunning(Uuid),
}

pub struct WorkflowEngine<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
    chain: Arc<dyn ChainAdapter>,
    storage: Arc<dyn StorageAdapter>,
    work_predicates: Arc<dyn WorkChainPredicates>,
    score_predicates: Arc<dyn ScoreChainPredicates>,
    epoch_predicates: Arc<dyn EpochChainPredicates>,
    signer_queue: SignerQueue,
    events: EventSink,
    /// One driver instance per record id at a time, per §5.
    running: Arc<Mutex<HashSet<Uuid>>>,
}

#[allow(clippy::too_many_arguments)]
impl<S: WorkflowStore + 'static> WorkflowEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: WorkflowRegistry,
        config: EngineConfig,
        chain: Arc<dyn ChainAdapter>,
        storage: Arc<dyn StorageAdapter>,
        work_predicates: Arc<dyn WorkChainPredicates>,
        score_predicates: Arc<dyn ScoreChainPredicates>,
        epoch_predicates: Arc<dyn EpochChainPredicates>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            chain,
            storage,
            work_predicates,
            score_predicates,
            epoch_predicates,
            signer_queue: SignerQueue::new(),
            events: EventSink::default(),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    #[instrument(skip(self, input, signer), fields(workflow_type = ?workflow_type))]
    pub async fn create_workflow(
        &self,
        workflow_type: WorkflowType,
        input: serde_json::Value,
        signer: impl Into<String>,
    ) -> Result<Uuid, ExecutorError> {
        let initial_step = self.registry.initial_step(workflow_type, &input)?;
        let record = WorkflowRecord::new(workflow_type, input, signer, initial_step);
        let id = record.id;
        self.store.create(record).await?;
        self.events
            .emit(EngineEvent::WorkflowCreated { workflow_id: id });
        Ok(id)
    }

    #[instrument(skip(self), fields(workflow_id = %id))]
    pub async fn start_workflow(&self, id: Uuid) -> Result<(), ExecutorError> {
        let mut record = self.store.load(id).await?;
        if record.state == MetaState::Created {
            self.store
                .update_state(id, MetaState::Running, &record.step, 0)
                .await?;
            record.state = MetaState::Running;
        }
        self.events
            .emit(EngineEvent::WorkflowStarted { workflow_id: id });
        self.drive(id).await
    }

    #[instrument(skip(self), fields(workflow_id = %id))]
    pub async fn resume_workflow(&self, id: Uuid) -> Result<(), ExecutorError> {
        self.drive(id).await
    }

    #[instrument(skip(self))]
    pub async fn reconcile_all_active(&self) -> Result<(), ExecutorError> {
        let active = self.store.find_active_workflows().await?;
        for record in active {
            if let Err(e) = self.drive(record.id).await {
                warn!(workflow_id = %record.id, error = %e, "error driving active workflow");
            }
        }
        Ok(())
    }

    fn reconcile_ctx(&self) -> ReconcileContext<'_> {
        ReconcileContext {
            chain: self.chain.as_ref(),
            storage: self.storage.as_ref(),
            work_predicates: self.work_predicates.as_ref(),
            score_predicates: self.score_predicates.as_ref(),
            epoch_predicates: self.epoch_predicates.as_ref(),
        }
    }

    fn step_context(&self) -> StepContext {
        let store: Arc<dyn WorkflowStore> = self.store.clone();
        StepContext {
            chain: self.chain.clone(),
            storage: self.storage.clone(),
            signer_queue: self.signer_queue.clone(),
            store,
            epoch_predicates: self.epoch_predicates.clone(),
        }
    }

    /// Drives `id` forward, one step at a time, until it blocks
    /// (terminal, stalled, or a retry sleep is owed), per §4.6.
    async fn drive(&self, id: Uuid) -> Result<(), ExecutorError> {
        {
            let mut running = self.running.lock();
            if !running.insert(id) {
                return Err(ExecutorError::AlreadyRunning(id));
            }
        }
        let result = self.drive_inner(id).await;
        self.running.lock().remove(&id);
        result
    }

    async fn drive_inner(&self, id: Uuid) -> Result<(), ExecutorError> {
        for _ in 0..self.config.max_steps_per_sweep {
            let record = self.store.load(id).await?;
            if record.state.is_terminal() {
                return Ok(());
            }

            let step_executor = self.registry.step(record.workflow_type, &record.step)?;

            if step_executor.is_irreversible() {
                let action = reconcile(&record, &self.reconcile_ctx()).await?;
                self.events
                    .emit(EngineEvent::ReconciliationRan { workflow_id: id });
                if !matches!(action, ReconcileAction::NoChange) {
                    self.apply_reconcile_action(&record, action).await?;
                    continue;
                }
            }

            self.events.emit(EngineEvent::StepStarted {
                workflow_id: id,
                step: record.step.clone(),
            });
            let outcome = step_executor.execute(&record, &self.step_context()).await;

            match outcome {
                StepOutcome::Success { next_step } => {
                    self.apply_success(&record, next_step).await?;
                }
                StepOutcome::Retry { error } => {
                    let should_stall = !self.apply_retry(&record, error).await?;
                    if should_stall {
                        return Ok(());
                    }
                    continue;
                }
                StepOutcome::Stalled { reason } => {
                    self.apply_stalled(&record, reason).await?;
                    return Ok(());
                }
                StepOutcome::Failed { error } => {
                    self.apply_failed(&record, error).await?;
                    return Ok(());
                }
            }
        }
        debug!(workflow_id = %id, "max steps per sweep reached, yielding");
        Ok(())
    }

    async fn apply_reconcile_action(
        &self,
        record: &WorkflowRecord,
        action: ReconcileAction,
    ) -> Result<(), ExecutorError> {
        match action {
            ReconcileAction::NoChange => Ok(()),
            ReconcileAction::AdvanceToStep {
                step,
                progress_updates,
            } => {
                self.store
                    .append_progress(record.id, progress_updates)
                    .await?;
                self.store
                    .update_state(record.id, MetaState::Running, &step, 0)
                    .await?;
                Ok(())
            }
            ReconcileAction::UpdateProgress { updates } => self
                .store
                .append_progress(record.id, updates)
                .await
                .map_err(Into::into),
            ReconcileAction::ClearTxHashAndRetry { field } => {
                self.store
                    .append_progress(
                        record.id,
                        Progress::from_fields([(field, serde_json::Value::Null)]),
                    )
                    .await?;
                self.store
                    .update_state(record.id, MetaState::Running, &record.step, 0)
                    .await?;
                Ok(())
            }
            ReconcileAction::Complete => self.complete(record).await,
            ReconcileAction::Fail { reason } => {
                self.fail(record, &reason, Some("RECONCILIATION_FAILURE"))
                    .await
            }
        }
    }

    async fn apply_success(
        &self,
        record: &WorkflowRecord,
        next_step: String,
    ) -> Result<(), ExecutorError> {
        self.events.emit(EngineEvent::StepCompleted {
            workflow_id: record.id,
            step: record.step.clone(),
        });
        if next_step == "COMPLETED" {
            return self.complete(record).await;
        }
        self.store
            .update_state(record.id, MetaState::Running, &next_step, 0)
            .await?;
        Ok(())
    }

    /// Returns `Ok(true)` if the caller should keep looping (sleep then
    /// retry), `Ok(false)` if attempts are exhausted and the workflow has
    /// been transitioned to STALLED.
    async fn apply_retry(
        &self,
        record: &WorkflowRecord,
        error: crate::step::ClassifiedError,
    ) -> Result<bool, ExecutorError> {
        use crate::reliability::classify::ErrorCategory;
        if error.category == ErrorCategory::Permanent {
            self.fail(record, &error.message, error.code.as_deref())
                .await?;
            return Ok(false);
        }

        let attempts = record.step_attempts + 1;
        if !self.config.retry_policy.has_attempts_remaining(attempts) {
            self.apply_stalled(
                record,
                format!("max retry attempts exhausted: {}", error.message),
            )
            .await?;
            return Ok(false);
        }

        self.store
            .update_state(record.id, MetaState::Running, &record.step, attempts)
            .await?;
        self.events.emit(EngineEvent::StepRetry {
            workflow_id: record.id,
            step: record.step.clone(),
            attempt: attempts,
            error,
        });
        let delay = self.config.retry_policy.delay_for_attempt(attempts);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(true)
    }

    async fn apply_stalled(
        &self,
        record: &WorkflowRecord,
        reason: String,
    ) -> Result<(), ExecutorError> {
        self.store
            .update_state(
                record.id,
                MetaState::Stalled,
                &record.step,
                record.step_attempts,
            )
            .await?;
        self.store
            .set_error(
                record.id,
                WorkflowError {
                    step: record.step.clone(),
                    message: reason.clone(),
                    code: None,
                    timestamp: Utc::now(),
                    recoverable: true,
                },
            )
            .await?;
        self.events.emit(EngineEvent::WorkflowStalled {
            workflow_id: record.id,
            reason,
        });
        Ok(())
    }

    async fn apply_failed(
        &self,
        record: &WorkflowRecord,
        error: crate::step::ClassifiedError,
    ) -> Result<(), ExecutorError> {
        self.fail(record, &error.message, error.code.as_deref())
            .await
    }

    async fn fail(
        &self,
        record: &WorkflowRecord,
        message: &str,
        code: Option<&str>,
    ) -> Result<(), ExecutorError> {
        self.store
            .update_state(
                record.id,
                MetaState::Failed,
                &record.step,
                record.step_attempts,
            )
            .await?;
        let error = WorkflowError {
            step: record.step.clone(),
            message: message.to_string(),
            code: code.map(|c| c.to_string()),
            timestamp: Utc::now(),
            recoverable: false,
        };
        self.store.set_error(record.id, error.clone()).await?;
        self.events.emit(EngineEvent::WorkflowFailed {
            workflow_id: record.id,
            error: crate::step::ClassifiedError {
                category: crate::reliability::classify::ErrorCategory::Permanent,
                message: message.to_string(),
                code: code.map(str::to_string),
            },
        });
        Ok(())
    }

    async fn complete(&self, record: &WorkflowRecord) -> Result<(), ExecutorError> {
        self.store
            .update_state(record.id, MetaState::Completed, "COMPLETED", 0)
            .await?;
        self.events.emit(EngineEvent::WorkflowCompleted {
            workflow_id: record.id,
        });
        info!(workflow_id = %record.id, "workflow completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::*;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::record::WorkflowType;
    use crate::step::Step;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysCompletePredicates;
    #[async_trait]
    impl WorkChainPredicates for AlwaysCompletePredicates {
        async fn work_already_registered(&self, _data_hash: &str) -> Result<bool, AdapterError> {
            Ok(false)
        }
        async fn work_exists_on_primary_ledger(
            &self,
            _data_hash: &str,
        ) -> Result<bool, AdapterError> {
            Ok(false)
        }
    }
    #[async_trait]
    impl ScoreChainPredicates for AlwaysCompletePredicates {
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
    #[async_trait]
    impl EpochChainPredicates for AlwaysCompletePredicates {
        async fn epoch_already_closed(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(true)
        }
        async fn epoch_ready_to_close(&self, _epoch_id: &str) -> Result<bool, AdapterError> {
            Ok(true)
        }
    }

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
            Ok("0x1".to_string())
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
            _min_confirmations: u64,
        ) -> Result<TxReceipt, AdapterError> {
            Ok(TxReceipt {
                status: TxStatus::Confirmed { block_number: 1 },
                block_number: Some(1),
                revert_reason: None,
            })
        }
    }

    struct NoopStorage;
    #[async_trait]
    impl StorageAdapter for NoopStorage {
        async fn upload(
            &self,
            _bytes: Vec<u8>,
            _tags: serde_json::Value,
        ) -> Result<String, AdapterError> {
            Ok("u1".to_string())
        }
        async fn status(&self, _id: &str) -> Result<UploadStatus, AdapterError> {
            Ok(UploadStatus::Confirmed)
        }
    }

    struct CountingStep(AtomicUsize);
    #[async_trait]
    impl Step for CountingStep {
        fn is_irreversible(&self) -> bool {
            false
        }
        async fn execute(&self, _record: &WorkflowRecord, _ctx: &StepContext) -> StepOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            StepOutcome::Success {
                next_step: "COMPLETED".to_string(),
            }
        }
    }

    struct OneStepDefinition(Arc<CountingStep>);
    impl crate::engine::registry::WorkflowDefinition for OneStepDefinition {
        fn initial_step(&self, _input: &serde_json::Value) -> String {
            "only".to_string()
        }
        fn step(&self, name: &str) -> Option<&dyn Step> {
            if name == "only" {
                Some(self.0.as_ref())
            } else {
                None
            }
        }
    }

    fn build_engine(step: Arc<CountingStep>) -> WorkflowEngine<InMemoryWorkflowStore> {
        let mut registry = WorkflowRegistry::new();
        registry.register(WorkflowType::CloseEpoch, Box::new(OneStepDefinition(step)));
        WorkflowEngine::new(
            Arc::new(InMemoryWorkflowStore::new()),
            registry,
            EngineConfig::default(),
            Arc::new(NoopChain),
            Arc::new(NoopStorage),
            Arc::new(AlwaysCompletePredicates),
            Arc::new(AlwaysCompletePredicates),
            Arc::new(AlwaysCompletePredicates),
        )
    }

    #[tokio::test]
    async fn create_and_start_completes_single_step_workflow() {
        let step = Arc::new(CountingStep(AtomicUsize::new(0)));
        let engine = build_engine(step.clone());
        let id = engine
            .create_workflow(WorkflowType::CloseEpoch, json!({"epoch": "1"}), "0xsigner")
            .await
            .unwrap();
        engine.start_workflow(id).await.unwrap();
        let record = engine.store.load(id).await.unwrap();
        assert_eq!(record.state, MetaState::Completed);
        assert_eq!(record.step, "COMPLETED");
        assert_eq!(step.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_attempts_reset_on_step_change() {
        let step = Arc::new(CountingStep(AtomicUsize::new(0)));
        let engine = build_engine(step);
        let id = engine
            .create_workflow(WorkflowType::CloseEpoch, json!({"epoch": "1"}), "0xsigner")
            .await
            .unwrap();
        engine.start_workflow(id).await.unwrap();
        let record = engine.store.load(id).await.unwrap();
        assert_eq!(record.step_attempts, 0);
    }
}
