//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::retry::RetryPolicy;

/// Tunables for the [`crate::engine::executor::WorkflowEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy applied to `RETRY` step outcomes.
    pub retry_policy: RetryPolicy,

    /// Wall-clock budget for storage-upload confirmation before a step
    /// yields `STALLED`.
    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub storage_confirm_budget: Duration,

    /// Wall-clock budget for on-chain transaction confirmation before a
    /// step yields `STALLED`.
    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub tx_confirm_budget: Duration,

    /// Safety cap on steps driven per workflow per `reconcileAllActive`
    /// sweep, mirroring the teacher's `max_events_per_workflow` guard
    /// against runaway loops.
    pub max_steps_per_sweep: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::exponential(),
            storage_confirm_budget: Duration::from_secs(600),
            tx_confirm_budget: Duration::from_secs(300),
            max_steps_per_sweep: 64,
        }
    }
}
