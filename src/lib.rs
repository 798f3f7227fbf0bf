//! Transaction submission and confirmation manager
//!
//! Publishes producer requests to a ledger that accepts one in-flight
//! transaction per account and nonce. A pool of signing accounts bounds
//! concurrency; submitted transactions are polled until included, and failed
//! attempts are retried with exponential backoff.

pub mod accounts;
pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod state;
pub mod tx;

pub use coordination::TransactionManager;
pub use error::{RelayerError, RelayerResult};
pub use events::TxEvent;
pub use tx::{TransactionRequest, TxId, TxStatus, TxStatusView};
