//! The durable workflow record: the single entity persisted for every
//! in-flight operation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The three workflow types this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    WorkSubmission,
    ScoreSubmission,
    CloseEpoch,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::WorkSubmission => "work_submission",
            WorkflowType::ScoreSubmission => "score_submission",
            WorkflowType::CloseEpoch => "close_epoch",
        }
    }
}

/// Top-level lifecycle state of a record.
///
/// `Completed` and `Failed` are terminal. `Stalled` is resumable: it is
/// driven back to `Running` by reconciliation, not by a distinct "resume"
/// state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetaState {
    Created,
    Running,
    Stalled,
    Completed,
    Failed,
}

impl MetaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MetaState::Completed | MetaState::Failed)
    }
}

/// The terminal or in-flight error attached to a record.
///
/// Set only when `state` is `Failed` or `Stalled`; `recoverable` must
/// match the state (`false` for `Failed`, `true` for `Stalled`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub step: String,
    pub message: String,
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

/// Append-only progress bag, merged right-wins on every `appendProgress`
/// call. The one exception — clearing a stale tx hash on
/// `CLEAR_TX_HASH_AND_RETRY` — is modeled as a normal merge that writes
/// `Value::Null` over the old key, since JSON merge-patch semantics treat
/// `null` as "delete this key" at read time via [`Progress::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Progress(BTreeMap<String, Value>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Merge `other` into `self`, right wins. A `Value::Null` entry in
    /// `other` clears the corresponding key (used to clear a stale tx
    /// hash per the reconciler's `CLEAR_TX_HASH_AND_RETRY` action).
    pub fn merge(&mut self, other: Progress) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }

    pub fn from_fields(fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self(fields.into_iter().collect())
    }
}

/// The single durable entity the engine drives to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub workflow_type: WorkflowType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: MetaState,
    /// Name of the current step. `"COMPLETED"` iff `state == Completed`.
    pub step: String,
    pub step_attempts: u32,
    /// Immutable once created.
    pub input: Value,
    pub progress: Progress,
    pub error: Option<WorkflowError>,
    pub signer: String,
}

impl WorkflowRecord {
    pub fn new(
        workflow_type: WorkflowType,
        input: Value,
        signer: impl Into<String>,
        initial_step: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_type,
            created_at: now,
            updated_at: now,
            state: MetaState::Created,
            step: initial_step.into(),
            step_attempts: 0,
            input,
            progress: Progress::new(),
            error: None,
            signer: signer.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, MetaState::Running | MetaState::Stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_merge_right_wins() {
        let mut p =
            Progress::from_fields([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
        let update =
            Progress::from_fields([("b".to_string(), json!(3)), ("c".to_string(), json!(4))]);
        p.merge(update);
        assert_eq!(p.get("a"), Some(&json!(1)));
        assert_eq!(p.get("b"), Some(&json!(3)));
        assert_eq!(p.get("c"), Some(&json!(4)));
    }

    #[test]
    fn progress_null_clears_key() {
        let mut p = Progress::from_fields([("tx_hash".to_string(), json!("0xabc"))]);
        assert!(p.contains("tx_hash"));
        p.merge(Progress::from_fields([(
            "tx_hash".to_string(),
            Value::Null,
        )]));
        assert!(!p.contains("tx_hash"));
    }

    #[test]
    fn new_record_defaults() {
        let r = WorkflowRecord::new(
            WorkflowType::CloseEpoch,
            json!({}),
            "0xsigner",
            "check_preconditions",
        );
        assert_eq!(r.state, MetaState::Created);
        assert_eq!(r.step_attempts, 0);
        assert!(!r.state.is_terminal());
    }
}
