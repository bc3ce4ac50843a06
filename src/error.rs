//! Crate-level error composition.

use thiserror::Error;

use crate::adapters::AdapterError;
use crate::engine::registry::RegistryError;
use crate::persistence::store::StoreError;
use crate::txqueue::TxQueueError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    TxQueue(#[from] TxQueueError),

    #[error("workflow {0} not found")]
    WorkflowNotFound(uuid::Uuid),

    #[error("workflow {0} is already terminal")]
    AlreadyTerminal(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;
