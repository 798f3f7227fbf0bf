//! Transaction requests, attempt records and the status state machine

use crate::error::{RelayerError, RelayerResult};
use crate::ledger::TxHandle;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Producer-facing handle, stable across retries
pub type TxId = Uuid;

/// Identity of a single attempt (one account/nonce binding)
pub type RecordId = Uuid;

/// Opaque call a producer wants published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub module: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

impl TransactionRequest {
    pub fn new(
        module: impl Into<String>,
        method: impl Into<String>,
        params: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            module: module.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Queued,
    Submitted,
    Confirmed,
    Failed,
    Cancelled,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Queued => "QUEUED",
            TxStatus::Submitted => "SUBMITTED",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Failed => "FAILED",
            TxStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (TxStatus::Queued, TxStatus::Submitted)
                | (TxStatus::Queued, TxStatus::Failed)
                | (TxStatus::Queued, TxStatus::Cancelled)
                | (TxStatus::Submitted, TxStatus::Confirmed)
                | (TxStatus::Submitted, TxStatus::Failed)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("submission failed: {0}")]
    SubmitFailed(String),

    #[error("rejected by ledger: {0}")]
    Rejected(String),

    #[error("not confirmed within {elapsed_ms}ms")]
    Stale { elapsed_ms: u64 },

    #[error("nonce unavailable: {0}")]
    NonceUnavailable(String),
}

impl FailureReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::SubmitFailed(_) => "submit_failed",
            FailureReason::Rejected(_) => "rejected",
            FailureReason::Stale { .. } => "stale",
            FailureReason::NonceUnavailable(_) => "nonce_unavailable",
        }
    }
}

/// Ledger identifiers of a confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub block: String,
    pub tx_hash: String,
}

/// One attempt at getting a request onto the ledger
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: RecordId,
    pub tx_id: TxId,
    pub request: TransactionRequest,
    pub account: Address,
    pub nonce: u64,
    pub status: TxStatus,
    pub handle: Option<TxHandle>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<FailureReason>,
    pub confirmation: Option<Confirmation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(
        tx_id: TxId,
        request: TransactionRequest,
        account: Address,
        nonce: u64,
        retry_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tx_id,
            request,
            account,
            nonce,
            status: TxStatus::Queued,
            handle: None,
            submitted_at: None,
            retry_count,
            last_error: None,
            confirmation: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: TxStatus) -> RelayerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_submitted(&mut self, handle: TxHandle) -> RelayerResult<()> {
        self.transition(TxStatus::Submitted)?;
        self.handle = Some(handle);
        self.submitted_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_confirmed(&mut self, confirmation: Confirmation) -> RelayerResult<()> {
        self.transition(TxStatus::Confirmed)?;
        self.confirmation = Some(confirmation);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: FailureReason) -> RelayerResult<()> {
        self.transition(TxStatus::Failed)?;
        self.last_error = Some(reason);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TxStatus::Confirmed | TxStatus::Failed)
    }
}

/// What a producer sees when asking about a transaction
#[derive(Debug, Clone, Serialize)]
pub struct TxStatusView {
    pub tx_id: TxId,
    pub request: TransactionRequest,
    pub status: TxStatus,
    pub retry_count: u32,
    pub last_error: Option<FailureReason>,
    pub attempts: usize,
    pub account: Option<Address>,
    pub nonce: Option<u64>,
    pub confirmation: Option<Confirmation>,
}
