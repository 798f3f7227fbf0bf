//! Retry scheduling with exponential backoff
//!
//! A failed attempt is either re-admitted to the queue as a fresh attempt
//! (after resyncing the account's nonce and waiting out the backoff) or, once
//! the retry limit is spent, finalized as `FAILED` and reported to observers.

use super::nonce::NonceAllocator;
use super::queue::{QueuedRequest, TransactionQueue};
use super::record::{FailureReason, RecordId, TransactionRecord, TransactionRequest, TxId};
use crate::coordination::RecordStore;
use crate::events::TxEvent;

use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&crate::config::RelayerConfig> for RetryPolicy {
    fn from(config: &crate::config::RelayerConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

/// Everything the scheduler needs to know about a failed attempt
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub tx_id: TxId,
    /// `None` when the failure happened before a record was bound
    pub record_id: Option<RecordId>,
    pub request: TransactionRequest,
    pub account: Address,
    pub retry_count: u32,
    pub reason: FailureReason,
}

impl FailedAttempt {
    pub fn from_record(record: &TransactionRecord, reason: FailureReason) -> Self {
        Self {
            tx_id: record.tx_id,
            record_id: Some(record.id),
            request: record.request.clone(),
            account: record.account,
            retry_count: record.retry_count,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { retry_count: u32, delay: Duration },
    Exhausted,
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Arc<TransactionQueue>,
    nonces: Arc<NonceAllocator>,
    store: Arc<RecordStore>,
    events: broadcast::Sender<TxEvent>,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        queue: Arc<TransactionQueue>,
        nonces: Arc<NonceAllocator>,
        store: Arc<RecordStore>,
        events: broadcast::Sender<TxEvent>,
    ) -> Self {
        Self {
            policy,
            queue,
            nonces,
            store,
            events,
        }
    }

    /// Decide the fate of a failed attempt.
    ///
    /// The transaction's status changes before this returns. The nonce resync
    /// and the delayed requeue run on a background task, so callers never
    /// wait on the ledger here.
    pub async fn handle_failure(&self, failure: FailedAttempt) -> RetryDecision {
        let decision = if failure.retry_count < self.policy.retry_limit {
            self.schedule_retry(&failure).await
        } else {
            self.finalize(&failure).await;
            RetryDecision::Exhausted
        };

        let requeue = match decision {
            RetryDecision::Retry { retry_count, delay } => Some((
                Instant::now() + delay,
                QueuedRequest {
                    tx_id: failure.tx_id,
                    request: failure.request,
                    retry_count,
                },
            )),
            RetryDecision::Exhausted => None,
        };
        self.spawn_recovery(failure.account, requeue);

        decision
    }

    fn spawn_recovery(&self, account: Address, requeue: Option<(Instant, QueuedRequest)>) {
        let nonces = self.nonces.clone();
        let queue = self.queue.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            // A stale local counter is the usual culprit, so repair it either way
            if let Err(e) = nonces.resync(account).await {
                warn!(address = ?account, "Nonce resync failed, will reseed lazily: {}", e);
                nonces.invalidate(account).await;
            }

            if let Some((deadline, entry)) = requeue {
                sleep_until(deadline).await;
                if store.is_queued(entry.tx_id).await {
                    queue.requeue(entry);
                }
            }
        });
    }

    async fn schedule_retry(&self, failure: &FailedAttempt) -> RetryDecision {
        let retry_count = failure.retry_count + 1;
        let delay = self.policy.delay_for(retry_count);

        if !self
            .store
            .mark_retrying(failure.tx_id, retry_count, failure.reason.clone())
            .await
        {
            // Withdrawn or unknown; nothing to retry
            return RetryDecision::Exhausted;
        }
        crate::metrics::record_tx_retried(failure.reason.label());

        info!(
            tx_id = %failure.tx_id,
            retry = retry_count,
            limit = self.policy.retry_limit,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry after {}",
            failure.reason
        );

        RetryDecision::Retry { retry_count, delay }
    }

    async fn finalize(&self, failure: &FailedAttempt) {
        let FailedAttempt {
            tx_id,
            record_id,
            retry_count,
            reason,
            ..
        } = failure;

        if !self.store.mark_failed(*tx_id, reason.clone()).await {
            return;
        }
        crate::metrics::record_tx_failed(reason.label());

        warn!(
            %tx_id,
            retries = *retry_count,
            "Transaction failed permanently: {}",
            reason
        );

        // No subscribers is fine
        let _ = self.events.send(TxEvent::Failed {
            tx_id: *tx_id,
            record_id: *record_id,
            retry_count: *retry_count,
            error: reason.clone(),
        });
    }
}
