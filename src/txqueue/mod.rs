//! Per-signer transaction serialization.
//!
//! The tx queue is the only point of cross-workflow serialization in the
//! system: two workflows sharing a signer must never have nonce-colliding
//! transactions in flight at once. The lock spans `submitOnly` through a
//! later, separate step's confirmation, so the hold itself is tracked as
//! logical state in a shared map rather than via a Rust-scope RAII guard,
//! which could never span two independent `Step::execute` calls (and
//! certainly not a process restart in between). Re-entrant acquisition by
//! the same workflow id is a no-op so a workflow resuming mid-submission
//! does not deadlock on its own held lock.
//!
//! Within `submit_only`'s own synchronous window — acquire, fetch nonce,
//! submit — a panic has nothing to gain from surviving, so that window
//! *is* guarded by a local `Drop` type (`AcquiredLock`) that releases the
//! lock unless explicitly defused. Defusing happens only once the tx hash
//! is in hand and the lock is handed off to the held-until-confirmed
//! state for the later step to release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::adapters::{AdapterError, ChainAdapter, SignedTxRequest, TxReceipt};

#[derive(Debug, Error)]
pub enum TxQueueError {
    #[error("timed out waiting for signer lock on {0}")]
    LockTimeout(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

struct LockState {
    holder: Option<Uuid>,
    depth: u32,
}

struct Inner {
    locks: parking_lot::Mutex<HashMap<String, LockState>>,
    notify: Notify,
}

/// Serializes chain submissions per signing address.
#[derive(Clone)]
pub struct SignerQueue {
    inner: Arc<Inner>,
}

/// Releases `signer`'s lock on drop unless [`defuse`](Self::defuse) was
/// called first. Scoped to `submit_only`'s synchronous window: acquire
/// through submit never awaits anything outside the chain adapter calls,
/// so a panic anywhere in that window is caught by this guard instead of
/// leaking the lock for the rest of the process's life.
struct AcquiredLock<'a> {
    queue: &'a SignerQueue,
    signer: &'a str,
    workflow_id: Uuid,
    armed: bool,
}

impl<'a> AcquiredLock<'a> {
    fn new(queue: &'a SignerQueue, signer: &'a str, workflow_id: Uuid) -> Self {
        Self {
            queue,
            signer,
            workflow_id,
            armed: true,
        }
    }

    /// Disarms the guard: the lock is now held across the confirmation
    /// step and must be released explicitly via `release_signer_lock`.
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for AcquiredLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue
                .release_signer_lock(self.signer, self.workflow_id);
        }
    }
}

impl Default for SignerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                locks: parking_lot::Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_locked(&self, signer: &str) -> bool {
        self.inner
            .locks
            .lock()
            .get(signer)
            .map(|l| l.holder.is_some())
            .unwrap_or(false)
    }

    /// Acquires the lock for `signer` on behalf of `workflow_id`,
    /// re-entrantly if that workflow already holds it.
    pub async fn acquire(
        &self,
        signer: &str,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> Result<(), TxQueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut locks = self.inner.locks.lock();
                let entry = locks
                    .entry(signer.to_string())
                    .or_insert_with(|| LockState {
                        holder: None,
                        depth: 0,
                    });
                if entry.holder.is_none() || entry.holder == Some(workflow_id) {
                    entry.holder = Some(workflow_id);
                    entry.depth += 1;
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TxQueueError::LockTimeout(signer.to_string()));
            }
            let _ = tokio::time::timeout(remaining, self.inner.notify.notified()).await;
        }
    }

    /// Explicit release. Idempotent: releasing a lock not held by
    /// `workflow_id` (or not held at all) is a no-op.
    pub fn release_signer_lock(&self, signer: &str, workflow_id: Uuid) {
        let mut locks = self.inner.locks.lock();
        if let Some(entry) = locks.get_mut(signer) {
            if entry.holder == Some(workflow_id) {
                entry.depth = entry.depth.saturating_sub(1);
                if entry.depth == 0 {
                    entry.holder = None;
                }
            }
        }
        drop(locks);
        self.inner.notify.notify_waiters();
    }

    /// Acquires the lock, fetches a nonce, submits, and returns the hash.
    /// The lock is NOT released on success — the caller's later step
    /// releases it after confirmation. Released on every failure path
    /// through this window, including a panic, via `AcquiredLock`.
    pub async fn submit_only(
        &self,
        chain: &dyn ChainAdapter,
        signer: &str,
        workflow_id: Uuid,
        mut req: SignedTxRequest,
        lock_timeout: Duration,
    ) -> Result<String, TxQueueError> {
        self.acquire(signer, workflow_id, lock_timeout).await?;
        let guard = AcquiredLock::new(self, signer, workflow_id);

        req.nonce = chain.fetch_nonce(signer).await?;
        let hash = chain.submit_signed_tx(signer, req).await?;

        guard.defuse();
        Ok(hash)
    }

    pub async fn wait_for_tx(
        &self,
        chain: &dyn ChainAdapter,
        tx_hash: &str,
        min_confirmations: u64,
    ) -> Result<TxReceipt, TxQueueError> {
        chain
            .wait_for_confirmation(tx_hash, min_confirmations)
            .await
            .map_err(Into::into)
    }

    pub async fn check_tx_status(
        &self,
        chain: &dyn ChainAdapter,
        tx_hash: &str,
    ) -> Result<Option<TxReceipt>, TxQueueError> {
        chain.fetch_tx_receipt(tx_hash).await.map_err(Into::into)
    }

    /// Convenience: acquire, submit, await confirmation, release.
    pub async fn submit_and_wait(
        &self,
        chain: &dyn ChainAdapter,
        signer: &str,
        workflow_id: Uuid,
        req: SignedTxRequest,
        min_confirmations: u64,
        lock_timeout: Duration,
    ) -> Result<(String, TxReceipt), TxQueueError> {
        let hash = self
            .submit_only(chain, signer, workflow_id, req, lock_timeout)
            .await?;
        let result = self.wait_for_tx(chain, &hash, min_confirmations).await;
        self.release_signer_lock(signer, workflow_id);
        Ok((hash, result?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reentrant_acquire_does_not_deadlock() {
        let queue = SignerQueue::new();
        let wf = Uuid::now_v7();
        queue
            .acquire("0xsigner", wf, Duration::from_secs(1))
            .await
            .unwrap();
        queue
            .acquire("0xsigner", wf, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(queue.is_locked("0xsigner"));
        queue.release_signer_lock("0xsigner", wf);
        assert!(queue.is_locked("0xsigner"));
        queue.release_signer_lock("0xsigner", wf);
        assert!(!queue.is_locked("0xsigner"));
    }

    #[tokio::test]
    async fn other_workflow_blocks_until_release() {
        let queue = SignerQueue::new();
        let wf1 = Uuid::now_v7();
        let wf2 = Uuid::now_v7();
        queue
            .acquire("0xsigner", wf1, Duration::from_secs(5))
            .await
            .unwrap();
        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move {
            queue2
                .acquire("0xsigner", wf2, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        queue.release_signer_lock("0xsigner", wf1);
        waiter.await.unwrap().unwrap();
        assert!(queue.is_locked("0xsigner"));
    }

    #[tokio::test]
    async fn lock_timeout_returns_error_without_leaking_state() {
        let queue = SignerQueue::new();
        let wf1 = Uuid::now_v7();
        let wf2 = Uuid::now_v7();
        queue
            .acquire("0xsigner", wf1, Duration::from_secs(5))
            .await
            .unwrap();
        let result = queue
            .acquire("0xsigner", wf2, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TxQueueError::LockTimeout(_))));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let queue = SignerQueue::new();
        let wf = Uuid::now_v7();
        queue.release_signer_lock("0xsigner", wf);
        queue.release_signer_lock("0xsigner", wf);
        assert!(!queue.is_locked("0xsigner"));
    }
}
