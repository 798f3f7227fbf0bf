//! Outcome notifications for producers
//!
//! Every transaction ends in exactly one `Confirmed` or `Failed` event.
//! Cancelled transactions are reported through their status only.

use crate::tx::{FailureReason, RecordId, TxId};

use ethers::types::Address;
use serde::Serialize;

/// Terminal outcome of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TxEvent {
    /// Included by the ledger
    Confirmed {
        tx_id: TxId,
        record_id: RecordId,
        account: Address,
        nonce: u64,
        block: String,
        tx_hash: String,
        retry_count: u32,
    },

    /// Retries exhausted
    Failed {
        tx_id: TxId,
        /// Last bound attempt; `None` if the final failure happened before binding
        record_id: Option<RecordId>,
        retry_count: u32,
        error: FailureReason,
    },
}

impl TxEvent {
    pub fn tx_id(&self) -> TxId {
        match self {
            TxEvent::Confirmed { tx_id, .. } | TxEvent::Failed { tx_id, .. } => *tx_id,
        }
    }

    /// Get event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            TxEvent::Confirmed { .. } => "confirmed",
            TxEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TxEvent::Confirmed { .. })
    }
}
