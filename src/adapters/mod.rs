//! Consumed interfaces: the external blockchain and storage network.
//!
//! These traits are the crate's only seam onto the outside world. No RPC
//! client, signer, or on-chain contract lives here — implementations are
//! supplied by the caller.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Adapter-layer failure. The raw message text is preserved (not folded
/// into an enum variant) because the reconciler's error classifier
/// pattern-matches substrings such as "nonce too low" or "revert" out of
/// it — see [`crate::reliability::classify`].
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("chain adapter error: {0}")]
    Chain(String),

    #[error("storage adapter error: {0}")]
    Storage(String),
}

impl AdapterError {
    pub fn message(&self) -> &str {
        match self {
            AdapterError::Chain(m) | AdapterError::Storage(m) => m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed { block_number: u64 },
    Reverted { reason: Option<&'static str> },
}

#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub revert_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignedTxRequest {
    pub to: String,
    pub data: Vec<u8>,
    pub value: Option<u128>,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Confirmed,
    NotFound,
}

/// Submits transactions and polls confirmation. Used only through the
/// [`crate::txqueue::SignerQueue`], which serializes access per signer.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    async fn fetch_nonce(&self, signer: &str) -> Result<u64, AdapterError>;

    async fn submit_signed_tx(
        &self,
        signer: &str,
        req: SignedTxRequest,
    ) -> Result<String, AdapterError>;

    async fn fetch_tx_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, AdapterError>;

    async fn wait_for_confirmation(
        &self,
        tx_hash: &str,
        min_confirmations: u64,
    ) -> Result<TxReceipt, AdapterError>;
}

/// Uploads content-addressed blobs to the storage network.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, tags: Value) -> Result<String, AdapterError>;

    async fn status(&self, id: &str) -> Result<UploadStatus, AdapterError>;
}

/// Read-only on-chain predicates specific to WorkSubmission. The primary
/// and secondary ledgers are checked independently: work can exist on the
/// primary ledger (after the `submit_onchain` tx) well before it is
/// registered in the secondary ledger (after the `register` tx).
#[async_trait]
pub trait WorkChainPredicates: Send + Sync {
    /// True once `data_hash` is registered in the secondary ledger.
    async fn work_already_registered(&self, data_hash: &str) -> Result<bool, AdapterError>;

    /// True once `data_hash` exists on the primary ledger.
    async fn work_exists_on_primary_ledger(&self, data_hash: &str) -> Result<bool, AdapterError>;
}

/// Read-only on-chain predicates specific to ScoreSubmission. `commit`,
/// `reveal`, and `score` each have their own existence predicate, because
/// the reconciler must be able to catch up on any one of the three
/// independently of whether the matching tx hash is present in progress.
#[async_trait]
pub trait ScoreChainPredicates: Send + Sync {
    async fn validator_registered(&self, signer: &str) -> Result<bool, AdapterError>;
    async fn score_already_submitted(
        &self,
        thread_root: &str,
        signer: &str,
    ) -> Result<bool, AdapterError>;
    async fn commitment_exists(
        &self,
        thread_root: &str,
        signer: &str,
    ) -> Result<bool, AdapterError>;
    async fn commitment_already_revealed(
        &self,
        thread_root: &str,
        signer: &str,
    ) -> Result<bool, AdapterError>;
}

/// Read-only on-chain predicates specific to CloseEpoch.
#[async_trait]
pub trait EpochChainPredicates: Send + Sync {
    async fn epoch_already_closed(&self, epoch_id: &str) -> Result<bool, AdapterError>;
    async fn epoch_ready_to_close(&self, epoch_id: &str) -> Result<bool, AdapterError>;
}
