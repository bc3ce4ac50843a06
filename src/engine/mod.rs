//! The workflow execution engine: driver loop, workflow registry, and
//! event notifications.

pub mod events;
pub mod executor;
pub mod registry;

pub use events::{EngineEvent, EventSink};
pub use executor::{ExecutorError, WorkflowEngine};
pub use registry::{RegistryError, WorkflowDefinition, WorkflowRegistry};
