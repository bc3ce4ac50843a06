//! # Epochflow
//!
//! A durable workflow orchestrator for multi-step, partially-irreversible
//! operations against an external blockchain and a content-addressed
//! storage network.
//!
//! ## Features
//!
//! - **Direct-mutation workflow records**: a single record is loaded,
//!   mutated, and persisted on every step — no event log or replay.
//! - **Reconciliation before irreversible steps**: local progress is
//!   checked against authoritative chain/storage state before any step
//!   that cannot be undone runs again.
//! - **Per-signer transaction serialization**: one in-flight transaction
//!   per signing address at a time, tracked as logical lock state that
//!   can span two independent step executions.
//! - **Automatic retries**: configurable exponential backoff, with error
//!   classification routing permanent failures straight to `FAILED`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                         │
//! │   (drives records step by step, reconciles, retries)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌─────────────────┐ ┌────────────────┐ ┌─────────────────┐
//! │  WorkflowStore   │ │   reconciler   │ │   SignerQueue   │
//! │ (Postgres / mem) │ │ (pure, by-type)│ │ (per-signer tx) │
//! └─────────────────┘ └────────────────┘ └─────────────────┘
//! ```

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod reconciler;
pub mod record;
pub mod reliability;
pub mod step;
pub mod txqueue;
pub mod workflows;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::adapters::{
        AdapterError, ChainAdapter, EpochChainPredicates, ScoreChainPredicates, SignedTxRequest,
        StorageAdapter, TxReceipt, TxStatus, UploadStatus, WorkChainPredicates,
    };
    pub use crate::config::EngineConfig;
    pub use crate::engine::{EngineEvent, ExecutorError, WorkflowEngine, WorkflowRegistry};
    pub use crate::error::{Error, Result};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{ClassifiedError, Step, StepContext, StepOutcome};
    pub use crate::txqueue::SignerQueue;
    pub use crate::workflows::build_registry;
}

pub use config::EngineConfig;
pub use engine::{EngineEvent, ExecutorError, WorkflowEngine, WorkflowRegistry};
pub use error::{Error, Result};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use record::{MetaState, Progress, WorkflowError, WorkflowRecord, WorkflowType};
pub use reliability::RetryPolicy;
pub use workflows::build_registry;
