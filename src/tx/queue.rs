//! Bounded FIFO of requests waiting for an account

use super::record::{TransactionRequest, TxId};
use crate::error::{RelayerError, RelayerResult};

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// A request waiting to be bound to an account and nonce
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub tx_id: TxId,
    pub request: TransactionRequest,
    pub retry_count: u32,
}

pub struct TransactionQueue {
    entries: Mutex<VecDeque<QueuedRequest>>,
    capacity: usize,
    available: Notify,
}

impl TransactionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            available: Notify::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a producer request, refusing with `Backpressure` when full
    pub fn enqueue(&self, entry: QueuedRequest) -> RelayerResult<()> {
        let depth = {
            let mut entries = self.entries();
            if entries.len() >= self.capacity {
                crate::metrics::record_backpressure();
                return Err(RelayerError::Backpressure {
                    capacity: self.capacity,
                });
            }
            entries.push_back(entry);
            entries.len()
        };

        crate::metrics::record_queue_depth(depth);
        self.available.notify_one();
        Ok(())
    }

    /// Re-admit a retry. Retries were already accepted once, so capacity is not enforced.
    pub fn requeue(&self, entry: QueuedRequest) {
        let depth = {
            let mut entries = self.entries();
            entries.push_back(entry);
            entries.len()
        };

        debug!("Requeued retry, queue depth {}", depth);
        crate::metrics::record_queue_depth(depth);
        self.available.notify_one();
    }

    pub fn try_dequeue(&self) -> Option<QueuedRequest> {
        let (entry, remaining) = {
            let mut entries = self.entries();
            let entry = entries.pop_front()?;
            (entry, entries.len())
        };

        crate::metrics::record_queue_depth(remaining);
        // Pass the wakeup along so a second waiter sees the remaining entries
        if remaining > 0 {
            self.available.notify_one();
        }
        Some(entry)
    }

    /// Wait for the next request
    pub async fn dequeue(&self) -> QueuedRequest {
        loop {
            if let Some(entry) = self.try_dequeue() {
                return entry;
            }
            self.available.notified().await;
        }
    }

    /// Withdraw a request that has not been picked up yet
    pub fn remove(&self, tx_id: TxId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.tx_id != tx_id);
        let removed = entries.len() != before;
        if removed {
            crate::metrics::record_queue_depth(entries.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
