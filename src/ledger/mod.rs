//! Ledger RPC boundary
//!
//! Everything the relayer needs from a ledger node goes through [`LedgerClient`]:
//! - the authoritative next nonce for an address
//! - submission of a signed transaction
//! - status lookup for a submitted transaction

#[cfg(test)]
pub(crate) mod fake;
mod rpc;

pub use rpc::JsonRpcLedger;

use crate::tx::SignedTransaction;

use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Ledger-assigned identity of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHandle(pub String);

impl TxHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the ledger reports about a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Included {
        block: String,
        #[serde(rename = "txHash", alias = "tx_hash")]
        tx_hash: String,
    },
    Rejected {
        #[serde(default)]
        reason: String,
    },
}

/// Ledger call failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger transport error: {0}")]
    Transport(String),

    #[error("Ledger call {operation} timed out")]
    Timeout { operation: String },

    #[error("Ledger rejected transaction: {0}")]
    Rejected(String),

    #[error("Malformed ledger response: {0}")]
    Malformed(String),
}

impl LedgerError {
    /// Everything except an explicit rejection is treated as transient
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LedgerError::Rejected(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Next nonce the ledger expects from `address`
    async fn next_nonce(&self, address: Address) -> Result<u64, LedgerError>;

    /// Broadcast a signed transaction
    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHandle, LedgerError>;

    /// Inclusion status of a previously submitted transaction
    async fn status(&self, handle: &TxHandle) -> Result<LedgerStatus, LedgerError>;
}

/// Run a ledger call with a deadline, mapping expiry to [`LedgerError::Timeout`]
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout {
            operation: operation.to_string(),
        }),
    }
}
