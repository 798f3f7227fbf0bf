//! Signing accounts and the pool that rations them

mod account;
mod pool;

#[cfg(test)]
pub(crate) use account::fixtures;
pub use account::{load_accounts, Account};
pub use pool::{AccountLease, AccountPool};
