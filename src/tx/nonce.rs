//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Lazy seeding of each account's counter from the ledger
//! - Per-account serialized allocation (accounts allocate in parallel)
//! - Tracking nonces whose transactions are still in flight
//! - Resync after failures to repair drift

use crate::error::{RelayerError, RelayerResult};
use crate::ledger::{bounded, LedgerClient};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-account nonce state
#[derive(Default)]
struct AccountNonceState {
    /// Next nonce to hand out; `None` until seeded from the ledger
    next: Option<u64>,
    /// Nonces of submitted, unresolved transactions
    in_flight: BTreeSet<u64>,
    /// Highest nonce seen confirmed
    confirmed: Option<u64>,
}

impl AccountNonceState {
    /// Lowest nonce that may still be handed out
    fn floor(&self) -> u64 {
        self.confirmed.map_or(0, |c| c + 1)
    }
}

/// Allocates nonces for every account in the pool
pub struct NonceAllocator {
    ledger: Arc<dyn LedgerClient>,
    rpc_timeout: Duration,
    accounts: DashMap<Address, Arc<Mutex<AccountNonceState>>>,
}

impl NonceAllocator {
    pub fn new(ledger: Arc<dyn LedgerClient>, rpc_timeout: Duration) -> Self {
        Self {
            ledger,
            rpc_timeout,
            accounts: DashMap::new(),
        }
    }

    fn state(&self, address: Address) -> Arc<Mutex<AccountNonceState>> {
        self.accounts.entry(address).or_default().clone()
    }

    /// Get the next nonce for an account.
    ///
    /// The first call for an address seeds the counter from the ledger. If that
    /// query fails the error is returned and nothing is consumed.
    pub async fn next_nonce(&self, address: Address) -> RelayerResult<u64> {
        let state = self.state(address);
        let mut state = state.lock().await;

        let mut nonce = match state.next {
            Some(next) => next,
            None => {
                let seeded = self.fetch_nonce(address).await?;
                debug!(address = ?address, nonce = seeded, "Seeded nonce from ledger");
                seeded.max(state.floor())
            }
        };

        // Never hand out a nonce that an unresolved transaction still holds
        while state.in_flight.contains(&nonce) {
            nonce += 1;
        }
        state.next = Some(nonce + 1);

        debug!(address = ?address, nonce, "Allocated nonce");
        Ok(nonce)
    }

    /// Mark a nonce as in flight once its transaction reached the ledger
    pub async fn mark_submitted(&self, address: Address, nonce: u64) {
        let state = self.state(address);
        state.lock().await.in_flight.insert(nonce);
    }

    /// Confirm a nonce (transaction included)
    pub async fn confirm(&self, address: Address, nonce: u64) {
        let state = self.state(address);
        let mut state = state.lock().await;
        state.in_flight.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
        if let Some(next) = state.next {
            state.next = Some(next.max(nonce + 1));
        }
    }

    /// Release a nonce whose transaction will never land
    pub async fn release(&self, address: Address, nonce: u64) {
        let state = self.state(address);
        let mut state = state.lock().await;
        state.in_flight.remove(&nonce);

        // If this was the last nonce handed out, it can be reused directly
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
        }
    }

    /// Re-seed an account's counter from the ledger.
    ///
    /// On failure the cached counter is left untouched.
    pub async fn resync(&self, address: Address) -> RelayerResult<u64> {
        let on_ledger = self.fetch_nonce(address).await?;

        let state = self.state(address);
        let mut state = state.lock().await;

        if let Some(next) = state.next {
            if next != on_ledger {
                warn!(
                    address = ?address,
                    local = next,
                    ledger = on_ledger,
                    "Nonce drift detected, resyncing"
                );
            }
        }

        // Anything below the ledger's count has landed
        state.in_flight = state.in_flight.split_off(&on_ledger);

        // The ledger may lag behind inclusions already observed here
        let next = on_ledger.max(state.floor());
        state.next = Some(next);

        info!(address = ?address, nonce = next, "Nonce resynced from ledger");
        Ok(next)
    }

    /// Drop the cached counter so the next allocation re-reads the ledger
    pub async fn invalidate(&self, address: Address) {
        let state = self.state(address);
        state.lock().await.next = None;
    }

    /// Next nonce that would be handed out, if seeded
    pub async fn peek(&self, address: Address) -> Option<u64> {
        let state = self.state(address);
        let state = state.lock().await;
        state.next
    }

    /// Number of unresolved nonces for an account
    pub async fn in_flight_count(&self, address: Address) -> usize {
        let state = self.state(address);
        let state = state.lock().await;
        state.in_flight.len()
    }

    /// Fetch nonce from the ledger
    async fn fetch_nonce(&self, address: Address) -> RelayerResult<u64> {
        bounded(
            self.rpc_timeout,
            "next_nonce",
            self.ledger.next_nonce(address),
        )
        .await
        .map_err(|e| RelayerError::Nonce {
            address: format!("{:?}", address),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, MockLedgerClient};
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn allocator(mock: MockLedgerClient) -> NonceAllocator {
        NonceAllocator::new(Arc::new(mock), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_sequential_allocation_without_gaps() {
        let mut mock = MockLedgerClient::new();
        mock.expect_next_nonce()
            .with(eq(addr(1)))
            .times(1)
            .returning(|_| Ok(40));
        let nonces = allocator(mock);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(nonces.next_nonce(addr(1)).await.unwrap());
        }
        assert_eq!(seen, vec![40, 41, 42, 43, 44]);
    }

    #[tokio::test]
    async fn test_ledger_failure_consumes_nothing() {
        let mut mock = MockLedgerClient::new();
        let mut seq = Sequence::new();
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(LedgerError::Transport("connection refused".into())));
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(3));
        let nonces = allocator(mock);

        let err = nonces.next_nonce(addr(1)).await.unwrap_err();
        assert!(matches!(err, RelayerError::Nonce { .. }));
        assert_eq!(nonces.peek(addr(1)).await, None);

        assert_eq!(nonces.next_nonce(addr(1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let mut mock = MockLedgerClient::new();
        mock.expect_next_nonce().with(eq(addr(1))).returning(|_| Ok(0));
        mock.expect_next_nonce().with(eq(addr(2))).returning(|_| Ok(100));
        let nonces = Arc::new(allocator(mock));

        let a = tokio::spawn({
            let nonces = nonces.clone();
            async move {
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(nonces.next_nonce(addr(1)).await.unwrap());
                }
                out
            }
        });
        let b = tokio::spawn({
            let nonces = nonces.clone();
            async move {
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(nonces.next_nonce(addr(2)).await.unwrap());
                }
                out
            }
        });

        assert_eq!(a.await.unwrap(), vec![0, 1, 2]);
        assert_eq!(b.await.unwrap(), vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_same_account_never_collide() {
        let mut mock = MockLedgerClient::new();
        mock.expect_next_nonce().times(1).returning(|_| Ok(10));
        let nonces = Arc::new(allocator(mock));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let nonces = nonces.clone();
                tokio::spawn(async move { nonces.next_nonce(addr(9)).await.unwrap() })
            })
            .collect();

        let mut got = Vec::new();
        for h in handles {
            got.push(h.await.unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, (10..26).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_release_rolls_back_last_nonce() {
        let mut mock = MockLedgerClient::new();
        mock.expect_next_nonce().returning(|_| Ok(5));
        let nonces = allocator(mock);

        let n = nonces.next_nonce(addr(1)).await.unwrap();
        assert_eq!(n, 5);
        nonces.release(addr(1), n).await;
        assert_eq!(nonces.next_nonce(addr(1)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_resync_skips_nonces_still_in_flight() {
        let mut mock = MockLedgerClient::new();
        let mut seq = Sequence::new();
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        // The ledger has only counted nonce 0 so far
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(1));
        let nonces = allocator(mock);
        let a = addr(1);

        for _ in 0..3 {
            let n = nonces.next_nonce(a).await.unwrap();
            nonces.mark_submitted(a, n).await;
        }
        // Nonce 2 failed and is abandoned; nonce 1 is still pending
        nonces.release(a, 2).await;
        assert_eq!(nonces.resync(a).await.unwrap(), 1);

        assert_eq!(nonces.in_flight_count(a).await, 1);
        assert_eq!(nonces.next_nonce(a).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_confirmed_nonce_not_reissued_after_lagging_resync() {
        let mut mock = MockLedgerClient::new();
        // The ledger keeps reporting 0 even after nonce 0 is included
        mock.expect_next_nonce().returning(|_| Ok(0));
        let nonces = allocator(mock);
        let a = addr(1);

        let first = nonces.next_nonce(a).await.unwrap();
        nonces.mark_submitted(a, first).await;
        assert_eq!(nonces.resync(a).await.unwrap(), 0);

        nonces.confirm(a, first).await;
        assert_ne!(nonces.next_nonce(a).await.unwrap(), first);

        // Later resyncs and reseeds respect the confirmed floor too
        assert_eq!(nonces.resync(a).await.unwrap(), 1);
        nonces.invalidate(a).await;
        assert_eq!(nonces.next_nonce(a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_resync_keeps_counter() {
        let mut mock = MockLedgerClient::new();
        let mut seq = Sequence::new();
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(8));
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(LedgerError::Timeout {
                operation: "next_nonce".into(),
            }));
        let nonces = allocator(mock);

        nonces.next_nonce(addr(1)).await.unwrap();
        assert!(nonces.resync(addr(1)).await.is_err());
        assert_eq!(nonces.peek(addr(1)).await, Some(9));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let mut mock = MockLedgerClient::new();
        let mut seq = Sequence::new();
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(1));
        mock.expect_next_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(20));
        let nonces = allocator(mock);

        assert_eq!(nonces.next_nonce(addr(1)).await.unwrap(), 1);
        nonces.invalidate(addr(1)).await;
        assert_eq!(nonces.next_nonce(addr(1)).await.unwrap(), 20);
    }
}
