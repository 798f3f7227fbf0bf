//! Per-transaction bookkeeping shared by the submitter, poller and retry path
//!
//! A `TxId` keeps the same entry across retries. Each account/nonce binding
//! adds an attempt record; the entry's status is what producers observe.

use crate::error::{RelayerError, RelayerResult};
use crate::tx::{
    Confirmation, FailureReason, RecordId, TransactionRecord, TransactionRequest, TxId, TxStatus,
    TxStatusView,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TrackedTransaction {
    request: TransactionRequest,
    status: TxStatus,
    retry_count: u32,
    last_error: Option<FailureReason>,
    attempts: Vec<TransactionRecord>,
    /// Attempt bound to an account that has not reached a terminal state
    active: Option<RecordId>,
    confirmation: Option<Confirmation>,
    updated_at: DateTime<Utc>,
}

impl TrackedTransaction {
    fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Cancelled
        )
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Count of tracked transactions per status
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub queued: usize,
    pub submitted: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StoreStats {
    pub fn total(&self) -> usize {
        self.queued + self.submitted + self.confirmed + self.failed + self.cancelled
    }
}

pub struct RecordStore {
    transactions: RwLock<HashMap<TxId, TrackedTransaction>>,
    journal: Option<mpsc::UnboundedSender<TransactionRecord>>,
}

impl RecordStore {
    pub fn new(journal: Option<mpsc::UnboundedSender<TransactionRecord>>) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            journal,
        }
    }

    fn journal(&self, record: &TransactionRecord) {
        if let Some(journal) = &self.journal {
            if journal.send(record.clone()).is_err() {
                debug!(record_id = %record.id, "Attempt journal closed, snapshot dropped");
            }
        }
    }

    /// Start tracking a newly accepted request
    pub async fn insert(&self, tx_id: TxId, request: TransactionRequest) {
        self.transactions.write().await.insert(
            tx_id,
            TrackedTransaction {
                request,
                status: TxStatus::Queued,
                retry_count: 0,
                last_error: None,
                attempts: Vec::new(),
                active: None,
                confirmation: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Forget a request that was never admitted
    pub async fn remove(&self, tx_id: TxId) {
        self.transactions.write().await.remove(&tx_id);
    }

    pub async fn is_queued(&self, tx_id: TxId) -> bool {
        self.transactions
            .read()
            .await
            .get(&tx_id)
            .map_or(false, |tx| tx.status == TxStatus::Queued && tx.active.is_none())
    }

    /// Attach a freshly bound attempt.
    ///
    /// Returns `false` when the transaction was withdrawn in the meantime; the
    /// caller must then give the nonce back.
    pub async fn bind(&self, record: &TransactionRecord) -> bool {
        {
            let mut txs = self.transactions.write().await;
            let Some(tx) = txs.get_mut(&record.tx_id) else {
                return false;
            };
            if tx.status != TxStatus::Queued || tx.active.is_some() {
                return false;
            }
            tx.active = Some(record.id);
            tx.attempts.push(record.clone());
            tx.touch();
        }
        self.journal(record);
        true
    }

    /// Store the latest snapshot of an attempt and lift its outcome onto the transaction
    pub async fn update(&self, record: &TransactionRecord) {
        {
            let mut txs = self.transactions.write().await;
            let Some(tx) = txs.get_mut(&record.tx_id) else {
                return;
            };
            match tx.attempts.iter_mut().find(|a| a.id == record.id) {
                Some(slot) => *slot = record.clone(),
                None => tx.attempts.push(record.clone()),
            }

            match record.status {
                TxStatus::Submitted => tx.status = TxStatus::Submitted,
                TxStatus::Confirmed => {
                    tx.status = TxStatus::Confirmed;
                    tx.confirmation = record.confirmation.clone();
                    tx.active = None;
                }
                TxStatus::Failed => {
                    // The retry path decides whether the transaction itself fails
                    tx.last_error = record.last_error.clone();
                    tx.active = None;
                }
                TxStatus::Queued | TxStatus::Cancelled => {}
            }
            tx.touch();
        }
        self.journal(record);
    }

    /// Put a transaction back to `QUEUED` for another attempt
    pub async fn mark_retrying(&self, tx_id: TxId, retry_count: u32, reason: FailureReason) -> bool {
        let mut txs = self.transactions.write().await;
        match txs.get_mut(&tx_id) {
            Some(tx) if !tx.is_terminal() => {
                tx.status = TxStatus::Queued;
                tx.retry_count = retry_count;
                tx.last_error = Some(reason);
                tx.active = None;
                tx.touch();
                true
            }
            _ => false,
        }
    }

    /// Fail a transaction for good. Returns `false` if it was already terminal.
    pub async fn mark_failed(&self, tx_id: TxId, reason: FailureReason) -> bool {
        let mut txs = self.transactions.write().await;
        match txs.get_mut(&tx_id) {
            Some(tx) if !tx.is_terminal() => {
                tx.status = TxStatus::Failed;
                tx.last_error = Some(reason);
                tx.active = None;
                tx.touch();
                true
            }
            _ => false,
        }
    }

    /// Withdraw a transaction that has not been bound to an account
    pub async fn cancel(&self, tx_id: TxId) -> RelayerResult<()> {
        let mut txs = self.transactions.write().await;
        let tx = txs
            .get_mut(&tx_id)
            .ok_or(RelayerError::TransactionNotFound { tx_id })?;

        if tx.status != TxStatus::Queued || tx.active.is_some() {
            return Err(RelayerError::NotCancellable {
                tx_id,
                status: tx.status.to_string(),
            });
        }

        tx.status = TxStatus::Cancelled;
        tx.touch();
        info!(%tx_id, "Transaction cancelled");
        Ok(())
    }

    pub async fn status(&self, tx_id: TxId) -> Option<TxStatusView> {
        let txs = self.transactions.read().await;
        let tx = txs.get(&tx_id)?;
        let latest = tx.attempts.last();
        Some(TxStatusView {
            tx_id,
            request: tx.request.clone(),
            status: tx.status,
            retry_count: tx.retry_count,
            last_error: tx.last_error.clone(),
            attempts: tx.attempts.len(),
            account: latest.map(|a| a.account),
            nonce: latest.map(|a| a.nonce),
            confirmation: tx.confirmation.clone(),
        })
    }

    /// Every attempt made for a transaction, oldest first
    pub async fn attempts(&self, tx_id: TxId) -> Vec<TransactionRecord> {
        self.transactions
            .read()
            .await
            .get(&tx_id)
            .map(|tx| tx.attempts.clone())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> StoreStats {
        let txs = self.transactions.read().await;
        let mut stats = StoreStats::default();
        for tx in txs.values() {
            match tx.status {
                TxStatus::Queued => stats.queued += 1,
                TxStatus::Submitted => stats.submitted += 1,
                TxStatus::Confirmed => stats.confirmed += 1,
                TxStatus::Failed => stats.failed += 1,
                TxStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop terminal transactions untouched for at least `retention`
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut txs = self.transactions.write().await;
        let before = txs.len();
        txs.retain(|_, tx| {
            let expired = (now - tx.updated_at)
                .to_std()
                .map_or(false, |age| age >= retention);
            !(tx.is_terminal() && expired)
        });
        let removed = before - txs.len();
        if removed > 0 {
            debug!(removed, "Pruned finished transactions");
        }
        removed
    }
}
