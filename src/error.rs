//! Error types for the transaction relayer

use crate::ledger::LedgerError;
use crate::tx::TxId;

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Nonce error for account {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Queue is at capacity ({capacity} pending requests), retry later")]
    Backpressure { capacity: usize },

    #[error("Account pool is closed")]
    PoolClosed,

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: TxId },

    #[error("Transaction {tx_id} cannot be cancelled in state {status}")]
    NotCancellable { tx_id: TxId, status: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Relayer already started")]
    AlreadyStarted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Ledger(e) => e.is_retryable(),
            RelayerError::Nonce { .. } | RelayerError::Backpressure { .. } => true,
            _ => false,
        }
    }

    /// Check if error means the producer should back off and retry the same call later
    pub fn is_backpressure(&self) -> bool {
        matches!(self, RelayerError::Backpressure { .. })
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
