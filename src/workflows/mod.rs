//! Concrete workflow pipelines: `WorkSubmission`, `ScoreSubmission`, and
//! `CloseEpoch`.

pub mod close_epoch;
pub mod roots;
pub mod score_submission;
pub mod work_submission;

use std::time::Duration;

use crate::engine::registry::WorkflowRegistry;
use crate::record::WorkflowType;

pub use close_epoch::CloseEpochDefinition;
pub use score_submission::ScoreSubmissionDefinition;
pub use work_submission::WorkSubmissionDefinition;

/// Builds the registry with all three workflow types wired in, using the
/// confirmation budgets from [`crate::config::EngineConfig`].
pub fn build_registry(
    storage_confirm_budget: Duration,
    tx_confirm_budget: Duration,
) -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register(
        WorkflowType::WorkSubmission,
        Box::new(WorkSubmissionDefinition::new(
            storage_confirm_budget,
            tx_confirm_budget,
        )),
    );
    registry.register(
        WorkflowType::ScoreSubmission,
        Box::new(ScoreSubmissionDefinition::new(tx_confirm_budget)),
    );
    registry.register(
        WorkflowType::CloseEpoch,
        Box::new(CloseEpochDefinition::new(tx_confirm_budget)),
    );
    registry
}
