//! Confirmation polling for submitted transactions
//!
//! The poller exclusively owns every `SUBMITTED` record (together with its
//! account lease) from the moment the submitter hands it over. Each pass
//! queries the ledger for all of them concurrently; a pass never overlaps the
//! next one.

use super::nonce::NonceAllocator;
use super::record::{Confirmation, FailureReason, RecordId, TransactionRecord};
use super::retry::{FailedAttempt, RetryScheduler};
use crate::accounts::{AccountLease, AccountPool};
use crate::coordination::RecordStore;
use crate::events::TxEvent;
use crate::ledger::{bounded, LedgerClient, LedgerError, LedgerStatus};

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A submitted record and the account it is holding
#[derive(Debug)]
pub struct InFlight {
    pub record: TransactionRecord,
    pub lease: AccountLease,
    pub submitted: Instant,
}

/// Counts from one polling pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub query_errors: usize,
}

pub struct ConfirmationPoller {
    ledger: Arc<dyn LedgerClient>,
    pool: AccountPool,
    nonces: Arc<NonceAllocator>,
    store: Arc<RecordStore>,
    retry: Arc<RetryScheduler>,
    events: broadcast::Sender<TxEvent>,
    inbox: mpsc::UnboundedReceiver<InFlight>,
    tracked: HashMap<RecordId, InFlight>,
    update_period: Duration,
    staleness_timeout: Duration,
    rpc_timeout: Duration,
}

impl ConfirmationPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        pool: AccountPool,
        nonces: Arc<NonceAllocator>,
        store: Arc<RecordStore>,
        retry: Arc<RetryScheduler>,
        events: broadcast::Sender<TxEvent>,
        inbox: mpsc::UnboundedReceiver<InFlight>,
        update_period: Duration,
        staleness_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            pool,
            nonces,
            store,
            retry,
            events,
            inbox,
            tracked: HashMap::new(),
            update_period,
            staleness_timeout,
            rpc_timeout,
        }
    }

    /// Poll every update period until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // First pass one period after start
        let mut ticker = interval_at(Instant::now() + self.update_period, self.update_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_ms = self.update_period.as_millis() as u64,
            "Confirmation poller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_once().await;
                    if summary.checked > 0 {
                        debug!(?summary, "Polling pass complete");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            abandoned = self.tracked.len(),
            "Confirmation poller stopped"
        );
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    /// One polling pass over every tracked record
    pub async fn poll_once(&mut self) -> PollSummary {
        while let Ok(flight) = self.inbox.try_recv() {
            self.tracked.insert(flight.record.id, flight);
        }
        crate::metrics::record_in_flight(self.tracked.len());

        let mut summary = PollSummary::default();
        if self.tracked.is_empty() {
            return summary;
        }

        let ledger = &self.ledger;
        let rpc_timeout = self.rpc_timeout;
        let checks = self.tracked.iter().map(|(id, flight)| {
            let id = *id;
            let handle = flight.record.handle.clone();
            async move {
                let result = match handle {
                    Some(handle) => bounded(rpc_timeout, "status", ledger.status(&handle)).await,
                    None => Err(LedgerError::Malformed("record has no ledger handle".into())),
                };
                (id, result)
            }
        });
        let results: Vec<(RecordId, Result<LedgerStatus, LedgerError>)> = join_all(checks).await;

        summary.checked = results.len();
        for (id, result) in results {
            let elapsed = match self.tracked.get(&id) {
                Some(flight) => flight.submitted.elapsed(),
                None => continue,
            };
            let stale = elapsed >= self.staleness_timeout;
            let stale_reason = FailureReason::Stale {
                elapsed_ms: elapsed.as_millis() as u64,
            };

            match result {
                Ok(LedgerStatus::Included { block, tx_hash }) => {
                    self.confirm(id, Confirmation { block, tx_hash }).await;
                    summary.confirmed += 1;
                }
                Ok(LedgerStatus::Rejected { reason }) => {
                    self.fail(id, FailureReason::Rejected(reason)).await;
                    summary.failed += 1;
                }
                Ok(LedgerStatus::Pending) if stale => {
                    self.fail(id, stale_reason).await;
                    summary.failed += 1;
                }
                Ok(LedgerStatus::Pending) => {}
                Err(e) => {
                    summary.query_errors += 1;
                    warn!(record_id = %id, "Status query failed, will retry next pass: {}", e);
                    if stale {
                        self.fail(id, stale_reason).await;
                        summary.failed += 1;
                    }
                }
            }
        }

        crate::metrics::record_in_flight(self.tracked.len());
        summary
    }

    async fn confirm(&mut self, id: RecordId, confirmation: Confirmation) {
        let Some(InFlight {
            mut record,
            lease,
            submitted,
        }) = self.tracked.remove(&id)
        else {
            return;
        };

        if let Err(e) = record.mark_confirmed(confirmation.clone()) {
            error!(record_id = %id, "Cannot confirm record: {}", e);
            return;
        }

        self.nonces.confirm(record.account, record.nonce).await;
        lease.record_success();
        self.pool.release(lease);

        self.store.update(&record).await;
        crate::metrics::record_tx_confirmed(&record.account, submitted.elapsed().as_secs_f64());

        info!(
            tx_id = %record.tx_id,
            record_id = %record.id,
            block = %confirmation.block,
            tx_hash = %confirmation.tx_hash,
            "Transaction confirmed"
        );

        let _ = self.events.send(TxEvent::Confirmed {
            tx_id: record.tx_id,
            record_id: record.id,
            account: record.account,
            nonce: record.nonce,
            block: confirmation.block,
            tx_hash: confirmation.tx_hash,
            retry_count: record.retry_count,
        });
    }

    async fn fail(&mut self, id: RecordId, reason: FailureReason) {
        let Some(InFlight {
            mut record, lease, ..
        }) = self.tracked.remove(&id)
        else {
            return;
        };

        if let Err(e) = record.mark_failed(reason.clone()) {
            error!(record_id = %id, "Cannot fail record: {}", e);
            return;
        }

        warn!(
            tx_id = %record.tx_id,
            record_id = %record.id,
            address = ?record.account,
            nonce = record.nonce,
            "Transaction attempt failed: {}",
            reason
        );

        // The attempt is abandoned; its nonce goes back to the allocator
        self.nonces.release(record.account, record.nonce).await;
        lease.record_failure();
        self.pool.release(lease);

        self.store.update(&record).await;
        self.retry
            .handle_failure(FailedAttempt::from_record(&record, reason))
            .await;
    }
}
