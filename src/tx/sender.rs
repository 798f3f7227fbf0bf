//! Transaction submitter: binds a queued request to an account and nonce,
//! signs it and hands it to the ledger

use super::nonce::NonceAllocator;
use super::poller::InFlight;
use super::queue::QueuedRequest;
use super::record::{FailureReason, TransactionRecord, TransactionRequest, TxId};
use super::retry::{FailedAttempt, RetryScheduler};
use crate::accounts::{Account, AccountPool};
use crate::coordination::RecordStore;
use crate::error::{RelayerError, RelayerResult};
use crate::ledger::{bounded, LedgerClient, LedgerError};

use ethers::types::Address;
use serde::Serialize;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A request signed by a pool account for a specific nonce
#[derive(Debug, Clone, Serialize)]
pub struct SignedTransaction {
    pub signer: Address,
    pub nonce: u64,
    pub module: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
    /// 0x-prefixed 65-byte recoverable signature over the payload digest
    pub signature: String,
    /// 0x-prefixed Keccak-256 of payload and signature
    pub hash: String,
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    signer: Address,
    nonce: u64,
    module: &'a str,
    method: &'a str,
    params: &'a [serde_json::Value],
}

impl SignedTransaction {
    pub fn sign(account: &Account, request: &TransactionRequest, nonce: u64) -> RelayerResult<Self> {
        let payload = serde_json::to_vec(&SigningPayload {
            signer: account.address(),
            nonce,
            module: &request.module,
            method: &request.method,
            params: &request.params,
        })
        .map_err(|e| RelayerError::Internal(format!("Failed to encode payload: {}", e)))?;

        let digest: [u8; 32] = Keccak256::digest(&payload).into();
        let signature = account.sign_digest(digest)?.to_vec();

        let mut hasher = Keccak256::new();
        hasher.update(&payload);
        hasher.update(&signature);
        let hash: [u8; 32] = hasher.finalize().into();

        Ok(Self {
            signer: account.address(),
            nonce,
            module: request.module.clone(),
            method: request.method.clone(),
            params: request.params.clone(),
            signature: format!("0x{}", hex::encode(signature)),
            hash: format!("0x{}", hex::encode(hash)),
        })
    }
}

/// What happened to one dequeued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// On the ledger and handed to the confirmation poller
    Submitted { record_id: uuid::Uuid },
    /// Withdrawn before an account was bound
    Cancelled,
    /// Went to the retry path without reaching the ledger
    Failed,
}

pub struct Submitter {
    ledger: Arc<dyn LedgerClient>,
    pool: AccountPool,
    nonces: Arc<NonceAllocator>,
    store: Arc<RecordStore>,
    retry: Arc<RetryScheduler>,
    poller: mpsc::UnboundedSender<InFlight>,
    rpc_timeout: Duration,
}

impl Submitter {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        pool: AccountPool,
        nonces: Arc<NonceAllocator>,
        store: Arc<RecordStore>,
        retry: Arc<RetryScheduler>,
        poller: mpsc::UnboundedSender<InFlight>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            pool,
            nonces,
            store,
            retry,
            poller,
            rpc_timeout,
        }
    }

    /// Drive one request from `QUEUED` to `SUBMITTED` or onto the retry path.
    ///
    /// Only a closed pool is returned as an error; every ledger failure is
    /// converted into record state.
    pub async fn process(&self, queued: QueuedRequest) -> RelayerResult<SubmitOutcome> {
        let QueuedRequest {
            tx_id,
            request,
            retry_count,
        } = queued;

        if !self.store.is_queued(tx_id).await {
            debug!(%tx_id, "Skipping withdrawn request");
            return Ok(SubmitOutcome::Cancelled);
        }

        let lease = self.pool.acquire().await?;
        crate::metrics::record_accounts_busy(self.pool.busy());
        let address = lease.address();

        let nonce = match self.nonces.next_nonce(address).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(%tx_id, address = ?address, "Nonce allocation failed: {}", e);
                self.pool.release(lease);
                self.retry
                    .handle_failure(FailedAttempt {
                        tx_id,
                        record_id: None,
                        request,
                        account: address,
                        retry_count,
                        reason: FailureReason::NonceUnavailable(e.to_string()),
                    })
                    .await;
                return Ok(SubmitOutcome::Failed);
            }
        };

        let mut record = TransactionRecord::new(tx_id, request, address, nonce, retry_count);
        if !self.store.bind(&record).await {
            debug!(%tx_id, "Request withdrawn while waiting for an account");
            self.nonces.release(address, nonce).await;
            self.pool.release(lease);
            return Ok(SubmitOutcome::Cancelled);
        }

        let sent = match SignedTransaction::sign(lease.account(), &record.request, nonce) {
            Ok(signed) => bounded(self.rpc_timeout, "submit", self.ledger.submit(&signed)).await,
            Err(e) => Err(LedgerError::Transport(e.to_string())),
        };

        match sent {
            Ok(handle) => {
                self.nonces.mark_submitted(address, nonce).await;
                record.mark_submitted(handle)?;
                self.store.update(&record).await;
                crate::metrics::record_tx_submitted(&address);

                info!(
                    %tx_id,
                    record_id = %record.id,
                    address = ?address,
                    nonce,
                    attempt = retry_count + 1,
                    "Transaction submitted"
                );

                let record_id = record.id;
                let flight = InFlight {
                    record,
                    lease,
                    submitted: Instant::now(),
                };
                if self.poller.send(flight).is_err() {
                    error!(%tx_id, "Confirmation poller is gone; record will not be tracked");
                }
                Ok(SubmitOutcome::Submitted { record_id })
            }
            Err(e) => {
                warn!(%tx_id, address = ?address, nonce, "Submission failed: {}", e);

                // Never reached the ledger, so the nonce is free again
                self.nonces.release(address, nonce).await;
                lease.record_failure();
                self.pool.release(lease);

                let reason = match e {
                    LedgerError::Rejected(msg) => FailureReason::Rejected(msg),
                    other => FailureReason::SubmitFailed(other.to_string()),
                };
                record.mark_failed(reason.clone())?;
                self.store.update(&record).await;
                self.retry
                    .handle_failure(FailedAttempt::from_record(&record, reason))
                    .await;
                Ok(SubmitOutcome::Failed)
            }
        }
    }
}
