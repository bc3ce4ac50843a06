//! Workflow definitions: an ordered map of named steps per workflow
//! type, keyed by [`WorkflowType`] the way the teacher's `AnyWorkflow`/
//! `WorkflowWrapper` erase concrete workflow types behind one registry —
//! adapted here to map to a step lookup rather than to a replay handler,
//! since this spec's record is directly mutated rather than replayed.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::record::WorkflowType;
use crate::step::Step;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no workflow definition registered for type {0:?}")]
    UnknownType(WorkflowType),

    #[error("unknown step {step:?} for workflow type {workflow_type:?}")]
    UnknownStep {
        workflow_type: WorkflowType,
        step: String,
    },
}

/// The ordered pipeline for one workflow type.
pub trait WorkflowDefinition: Send + Sync {
    /// The step a freshly-created record starts at, chosen from `input`
    /// (ScoreSubmission branches on `input.mode`).
    fn initial_step(&self, input: &Value) -> String;

    fn step(&self, name: &str) -> Option<&dyn Step>;
}

pub struct WorkflowRegistry {
    definitions: HashMap<WorkflowType, Box<dyn WorkflowDefinition>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        workflow_type: WorkflowType,
        definition: Box<dyn WorkflowDefinition>,
    ) {
        self.definitions.insert(workflow_type, definition);
    }

    pub fn initial_step(
        &self,
        workflow_type: WorkflowType,
        input: &Value,
    ) -> Result<String, RegistryError> {
        self.definitions
            .get(&workflow_type)
            .map(|d| d.initial_step(input))
            .ok_or(RegistryError::UnknownType(workflow_type))
    }

    pub fn step(
        &self,
        workflow_type: WorkflowType,
        name: &str,
    ) -> Result<&dyn Step, RegistryError> {
        let definition = self
            .definitions
            .get(&workflow_type)
            .ok_or(RegistryError::UnknownType(workflow_type))?;
        definition
            .step(name)
            .ok_or_else(|| RegistryError::UnknownStep {
                workflow_type,
                step: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WorkflowRecord;
    use crate::step::{StepContext, StepOutcome};
    use async_trait::async_trait;

    struct NoopStep;
    #[async_trait]
    impl Step for NoopStep {
        fn is_irreversible(&self) -> bool {
            false
        }
        async fn execute(&self, _record: &WorkflowRecord, _ctx: &StepContext) -> StepOutcome {
            StepOutcome::Success {
                next_step: "COMPLETED".to_string(),
            }
        }
    }

    struct SingleStepDefinition;
    impl WorkflowDefinition for SingleStepDefinition {
        fn initial_step(&self, _input: &Value) -> String {
            "only".to_string()
        }
        fn step(&self, name: &str) -> Option<&dyn Step> {
            if name == "only" {
                Some(&NoopStep)
            } else {
                None
            }
        }
    }

    #[test]
    fn unknown_type_errors() {
        let registry = WorkflowRegistry::new();
        let err = registry
            .initial_step(WorkflowType::CloseEpoch, &Value::Null)
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(_)));
    }

    #[test]
    fn registered_type_resolves_steps() {
        let mut registry = WorkflowRegistry::new();
        registry.register(WorkflowType::CloseEpoch, Box::new(SingleStepDefinition));
        assert_eq!(
            registry
                .initial_step(WorkflowType::CloseEpoch, &Value::Null)
                .unwrap(),
            "only"
        );
        assert!(registry.step(WorkflowType::CloseEpoch, "only").is_ok());
        assert!(registry.step(WorkflowType::CloseEpoch, "missing").is_err());
    }
}
