//! Scripted in-memory ledger for tests

use super::{LedgerClient, LedgerError, LedgerStatus, TxHandle};
use crate::tx::SignedTransaction;

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    /// Report inclusion once the transaction has been polled this many times
    ConfirmAfter(u32),
    RejectAll,
    PendingForever,
}

#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub signer: Address,
    pub nonce: u64,
    pub hash: String,
    pub at: Instant,
}

struct FakeState {
    behavior: Behavior,
    next_nonce: HashMap<Address, u64>,
    submissions: Vec<Submission>,
    polls: HashMap<String, u32>,
    failing_submits: u32,
    nonce_unreachable: bool,
    status_unreachable: bool,
    nonce_queries: u32,
    nonce_delay: Duration,
    block: u64,
}

pub(crate) struct FakeLedger {
    state: Mutex<FakeState>,
}

impl FakeLedger {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            state: Mutex::new(FakeState {
                behavior,
                next_nonce: HashMap::new(),
                submissions: Vec::new(),
                polls: HashMap::new(),
                failing_submits: 0,
                nonce_unreachable: false,
                status_unreachable: false,
                nonce_queries: 0,
                nonce_delay: Duration::ZERO,
                block: 100,
            }),
        }
    }

    pub fn set_next_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().next_nonce.insert(address, nonce);
    }

    /// Make every nonce query take this long
    pub fn set_nonce_delay(&self, delay: Duration) {
        self.state.lock().unwrap().nonce_delay = delay;
    }

    /// Fail the next `count` submissions with a transport error
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().unwrap().failing_submits = count;
    }

    pub fn set_nonce_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().nonce_unreachable = unreachable;
    }

    pub fn set_status_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().status_unreachable = unreachable;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn nonce_queries(&self) -> u32 {
        self.state.lock().unwrap().nonce_queries
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn next_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        let delay = self.state.lock().unwrap().nonce_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.nonce_queries += 1;
        if state.nonce_unreachable {
            return Err(LedgerError::Transport("connection refused".to_string()));
        }
        Ok(state.next_nonce.get(&address).copied().unwrap_or(0))
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(LedgerError::Transport("connection reset".to_string()));
        }
        state.submissions.push(Submission {
            signer: tx.signer,
            nonce: tx.nonce,
            hash: tx.hash.clone(),
            at: Instant::now(),
        });
        state.polls.insert(tx.hash.clone(), 0);
        Ok(TxHandle(tx.hash.clone()))
    }

    async fn status(&self, handle: &TxHandle) -> Result<LedgerStatus, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.status_unreachable {
            return Err(LedgerError::Transport("connection refused".to_string()));
        }
        let behavior = state.behavior;
        let polls = match state.polls.get_mut(handle.as_str()) {
            Some(polls) => {
                *polls += 1;
                *polls
            }
            None => return Err(LedgerError::Malformed("unknown transaction".to_string())),
        };

        match behavior {
            Behavior::ConfirmAfter(required) if polls >= required => {
                let submission = state
                    .submissions
                    .iter()
                    .find(|s| s.hash == handle.as_str())
                    .cloned();
                if let Some(submission) = submission {
                    let next = state.next_nonce.entry(submission.signer).or_insert(0);
                    *next = (*next).max(submission.nonce + 1);
                }
                state.block += 1;
                Ok(LedgerStatus::Included {
                    block: format!("0x{:x}", state.block),
                    tx_hash: handle.0.clone(),
                })
            }
            Behavior::ConfirmAfter(_) | Behavior::PendingForever => Ok(LedgerStatus::Pending),
            Behavior::RejectAll => Ok(LedgerStatus::Rejected {
                reason: "invalid transaction".to_string(),
            }),
        }
    }
}
