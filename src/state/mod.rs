//! Attempt history persistence with PostgreSQL
//!
//! Handles:
//! - Schema setup for the attempt journal
//! - Upserting every attempt snapshot
//! - Database health checks

mod manager;

pub use manager::{run_journal, AttemptJournal, StateManager};
