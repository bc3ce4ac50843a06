//! The durable persistence contract.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow record {0} already exists")]
    DuplicateRecord(Uuid),

    #[error("workflow record {0} not found")]
    NotFound(Uuid),

    #[error("concurrent modification of workflow record {0}")]
    ConcurrencyConflict(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for [`WorkflowRecord`]s.
///
/// Write-ahead invariant: callers MUST persist any information required
/// to reconcile a pending action (in particular a submitted tx hash) via
/// [`append_progress`](WorkflowStore::append_progress) *before* the step
/// that produced it returns — never after.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create(&self, record: WorkflowRecord) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<WorkflowRecord, StoreError>;

    /// Atomically transitions `state`/`step`/`step_attempts`. Fails
    /// `NotFound` if the record does not exist.
    async fn update_state(
        &self,
        id: Uuid,
        state: MetaState,
        step: &str,
        step_attempts: u32,
    ) -> Result<(), StoreError>;

    /// Atomically merges `fields` into the record's progress bag,
    /// right-wins, in a single transaction.
    async fn append_progress(&self, id: Uuid, fields: Progress) -> Result<(), StoreError>;

    async fn set_error(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError>;

    /// Records currently RUNNING or STALLED, oldest `created_at` first.
    async fn find_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn find_by_type_and_state(
        &self,
        workflow_type: WorkflowType,
        state: MetaState,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;
}
