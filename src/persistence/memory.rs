//! In-memory [`WorkflowStore`] implementation, used by every unit test
//! and by the doc examples.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persistence::store::{StoreError, WorkflowStore};
use crate::record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    records: RwLock<HashMap<Uuid, WorkflowRecord>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateRecord(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_state(
        &self,
        id: Uuid,
        state: MetaState,
        step: &str,
        step_attempts: u32,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.state = state;
        record.step = step.to_string();
        record.step_attempts = step_attempts;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_progress(&self, id: Uuid, fields: Progress) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.progress.merge(fields);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_error(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.error = Some(error);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn find_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let records = self.records.read();
        let mut active: Vec<WorkflowRecord> = records
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.created_at);
        Ok(active)
    }

    async fn find_by_type_and_state(
        &self,
        workflow_type: WorkflowType,
        state: MetaState,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let records = self.records.read();
        let mut matching: Vec<WorkflowRecord> = records
            .values()
            .filter(|r| r.workflow_type == workflow_type && r.state == state)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }
}
