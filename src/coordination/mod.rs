//! Coordination of the submission pipeline
//!
//! The transaction manager:
//! 1. Accepts producer requests, applying backpressure at the queue
//! 2. Runs submission workers that bind requests to accounts and nonces
//! 3. Runs the confirmation poller over submitted transactions
//! 4. Tracks every transaction and its attempts in the record store

pub mod engine;
pub mod store;

pub use engine::{ManagerSnapshot, TransactionManager};
pub use store::{RecordStore, StoreStats};
