//! Bounded pool of signing accounts
//!
//! The pool is the relayer's only admission control: a transaction can only be
//! in flight while it holds an [`AccountLease`], so the number of concurrent
//! submissions never exceeds the number of usable accounts.

use super::Account;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

struct Slot {
    account: Arc<Account>,
    in_use: bool,
    consecutive_failures: u32,
    disabled: bool,
}

struct PoolInner {
    slots: Mutex<Vec<Slot>>,
    /// One permit per free, usable slot
    permits: Arc<Semaphore>,
    max_failures: u32,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of signing accounts handed out exclusively
#[derive(Clone)]
pub struct AccountPool {
    inner: Arc<PoolInner>,
}

impl AccountPool {
    /// Create a pool; `max_failures` of zero never disables an account
    pub fn new(accounts: Vec<Account>, max_failures: u32) -> RelayerResult<Self> {
        if accounts.is_empty() {
            return Err(RelayerError::Config(
                "Account pool needs at least one account".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = accounts.iter().find(|a| !seen.insert(a.address())) {
            return Err(RelayerError::Config(format!(
                "Duplicate account {:?} in pool",
                dup.address()
            )));
        }

        let size = accounts.len();
        let slots = accounts
            .into_iter()
            .map(|account| Slot {
                account: Arc::new(account),
                in_use: false,
                consecutive_failures: 0,
                disabled: false,
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(slots),
                permits: Arc::new(Semaphore::new(size)),
                max_failures,
            }),
        })
    }

    /// Take a free account without waiting
    pub fn try_acquire(&self) -> Option<AccountLease> {
        let permit = self.inner.permits.clone().try_acquire_owned().ok()?;
        self.bind(permit)
    }

    /// Wait until an account is free
    pub async fn acquire(&self) -> RelayerResult<AccountLease> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayerError::PoolClosed)?;

        self.bind(permit)
            .ok_or_else(|| RelayerError::Internal("permit granted with no free account".into()))
    }

    /// Return an account to the pool
    pub fn release(&self, lease: AccountLease) {
        drop(lease);
    }

    /// Wake every waiter with [`RelayerError::PoolClosed`]
    pub fn close(&self) {
        self.inner.permits.close();
    }

    fn bind(&self, permit: OwnedSemaphorePermit) -> Option<AccountLease> {
        let mut slots = self.inner.slots();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.in_use && !s.disabled)?;

        slot.in_use = true;
        debug!(address = ?slot.account.address(), "Account acquired");

        Some(AccountLease {
            pool: self.inner.clone(),
            index,
            account: slot.account.clone(),
            permit: Some(permit),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn available(&self) -> usize {
        self.inner
            .slots()
            .iter()
            .filter(|s| !s.in_use && !s.disabled)
            .count()
    }

    pub fn busy(&self) -> usize {
        self.inner.slots().iter().filter(|s| s.in_use).count()
    }

    /// Accounts not taken out of rotation
    pub fn usable(&self) -> usize {
        self.inner.slots().iter().filter(|s| !s.disabled).count()
    }
}

/// Exclusive use of one account; the account returns to the pool on drop
pub struct AccountLease {
    pool: Arc<PoolInner>,
    index: usize,
    account: Arc<Account>,
    permit: Option<OwnedSemaphorePermit>,
}

impl AccountLease {
    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn address(&self) -> Address {
        self.account.address()
    }

    /// A transaction from this account confirmed
    pub fn record_success(&self) {
        self.pool.slots()[self.index].consecutive_failures = 0;
    }

    /// A transaction from this account failed; returns true if the account
    /// has now been taken out of rotation
    pub fn record_failure(&self) -> bool {
        let mut slots = self.pool.slots();
        let slot = &mut slots[self.index];
        slot.consecutive_failures += 1;

        if self.pool.max_failures == 0
            || slot.disabled
            || slot.consecutive_failures < self.pool.max_failures
        {
            return false;
        }

        slot.disabled = true;
        warn!(
            address = ?slot.account.address(),
            failures = slot.consecutive_failures,
            "Account marked unusable after repeated failures"
        );
        crate::metrics::record_account_disabled(&slot.account.address());

        if slots.iter().all(|s| s.disabled) {
            error!("Every account in the pool is unusable; submissions will stall");
        }
        true
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        let mut slots = self.pool.slots();
        let slot = &mut slots[self.index];
        slot.in_use = false;

        // A disabled slot keeps its permit out of circulation
        if slot.disabled {
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
        debug!(address = ?slot.account.address(), "Account released");
    }
}

impl std::fmt::Debug for AccountLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLease")
            .field("address", &self.account.address())
            .finish()
    }
}
