//! PostgreSQL implementation of [`WorkflowStore`].
//!
//! Uses a connection pool and jsonb columns for `input`/`progress`/
//! `error`. `append_progress` is a single `UPDATE ... SET progress =
//! progress || $2` statement — Postgres's jsonb concatenation operator
//! performs the right-wins merge server-side, so there is no read-
//! modify-write race the way there would be if the merge were done in
//! application code.
//!
//! ```sql
//! CREATE TABLE workflow_records (
//!     id UUID PRIMARY KEY,
//!     workflow_type TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     state TEXT NOT NULL,
//!     step TEXT NOT NULL,
//!     step_attempts INT NOT NULL,
//!     input JSONB NOT NULL,
//!     progress JSONB NOT NULL DEFAULT '{}',
//!     error JSONB,
//!     signer TEXT NOT NULL
//! );
//! CREATE INDEX idx_workflow_records_active ON workflow_records (state, created_at);
//! CREATE INDEX idx_workflow_records_type_state ON workflow_records (workflow_type, state);
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row as _};
use tracing::instrument;
use uuid::Uuid;

use crate::persistence::store::{StoreError, WorkflowStore};
use crate::record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};

pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn state_str(state: MetaState) -> &'static str {
    match state {
        MetaState::Created => "CREATED",
        MetaState::Running => "RUNNING",
        MetaState::Stalled => "STALLED",
        MetaState::Completed => "COMPLETED",
        MetaState::Failed => "FAILED",
    }
}

fn parse_state(s: &str) -> Result<MetaState, StoreError> {
    match s {
        "CREATED" => Ok(MetaState::Created),
        "RUNNING" => Ok(MetaState::Running),
        "STALLED" => Ok(MetaState::Stalled),
        "COMPLETED" => Ok(MetaState::Completed),
        "FAILED" => Ok(MetaState::Failed),
        other => Err(StoreError::Serialization(format!("unknown state: {other}"))),
    }
}

fn parse_type(s: &str) -> Result<WorkflowType, StoreError> {
    match s {
        "work_submission" => Ok(WorkflowType::WorkSubmission),
        "score_submission" => Ok(WorkflowType::ScoreSubmission),
        "close_epoch" => Ok(WorkflowType::CloseEpoch),
        other => Err(StoreError::Serialization(format!(
            "unknown workflow type: {other}"
        ))),
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<WorkflowRecord, StoreError> {
    let progress_value: serde_json::Value = row.get("progress");
    let progress: Progress = serde_json::from_value(progress_value)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let error_value: Option<serde_json::Value> = row.get("error");
    let error = error_value
        .map(serde_json::from_value::<WorkflowError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let workflow_type: String = row.get("workflow_type");
    let state: String = row.get("state");

    Ok(WorkflowRecord {
        id: row.get("id"),
        workflow_type: parse_type(&workflow_type)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        state: parse_state(&state)?,
        step: row.get("step"),
        step_attempts: row.get::<i32, _>("step_attempts") as u32,
        input: row.get("input"),
        progress,
        error,
        signer: row.get("signer"),
    })
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, record), fields(workflow_id = %record.id))]
    async fn create(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_records
                (id, workflow_type, created_at, updated_at, state, step, step_attempts, input, progress, error, signer)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.workflow_type.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(state_str(record.state))
        .bind(&record.step)
        .bind(record.step_attempts as i32)
        .bind(&record.input)
        .bind(serde_json::to_value(&record.progress).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(record.error.as_ref().map(serde_json::to_value).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&record.signer)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateRecord(record.id))
            }
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    #[instrument(skip(self), fields(workflow_id = %id))]
    async fn load(&self, id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, created_at, updated_at, state, step, step_attempts,
                   input, progress, error, signer
            FROM workflow_records WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::NotFound(id))?;

        row_to_record(&row)
    }

    #[instrument(skip(self), fields(workflow_id = %id))]
    async fn update_state(
        &self,
        id: Uuid,
        state: MetaState,
        step: &str,
        step_attempts: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_records
            SET state = $2, step = $3, step_attempts = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state_str(state))
        .bind(step)
        .bind(step_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, fields), fields(workflow_id = %id))]
    async fn append_progress(&self, id: Uuid, fields: Progress) -> Result<(), StoreError> {
        let patch =
            serde_json::to_value(&fields).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_records
            SET progress = progress || $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(workflow_id = %id))]
    async fn set_error(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(&error).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_records SET error = $2, updated_at = now() WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_type, created_at, updated_at, state, step, step_attempts,
                   input, progress, error, signer
            FROM workflow_records
            WHERE state IN ('RUNNING', 'STALLED')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn find_by_type_and_state(
        &self,
        workflow_type: WorkflowType,
        state: MetaState,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_type, created_at, updated_at, state, step, step_attempts,
                   input, progress, error, signer
            FROM workflow_records
            WHERE workflow_type = $1 AND state = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(workflow_type.as_str())
        .bind(state_str(state))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }
}
