//! Transaction manager: wires the pool, queue, allocator, submitter, poller
//! and retry scheduler together and runs them

use super::store::{RecordStore, StoreStats};
use crate::accounts::{Account, AccountPool};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::TxEvent;
use crate::ledger::LedgerClient;
use crate::tx::{
    ConfirmationPoller, NonceAllocator, QueuedRequest, RetryPolicy, RetryScheduler, Submitter,
    TransactionQueue, TransactionRecord, TransactionRequest, TxId, TxStatusView,
};

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Point-in-time counters for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub instance_id: String,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub accounts_total: usize,
    pub accounts_usable: usize,
    pub accounts_busy: usize,
    pub transactions: StoreStats,
}

pub struct TransactionManager {
    config: RelayerConfig,
    pool: AccountPool,
    queue: Arc<TransactionQueue>,
    store: Arc<RecordStore>,
    submitter: Arc<Submitter>,
    events: broadcast::Sender<TxEvent>,
    /// Taken by `start`; `None` afterwards
    poller: Mutex<Option<ConfirmationPoller>>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    /// Build a manager. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: RelayerConfig,
        accounts: Vec<Account>,
        ledger: Arc<dyn LedgerClient>,
        journal: Option<mpsc::UnboundedSender<TransactionRecord>>,
    ) -> RelayerResult<Self> {
        let pool = AccountPool::new(accounts, config.max_account_failures)?;
        let queue = Arc::new(TransactionQueue::new(config.queue_capacity));
        let nonces = Arc::new(NonceAllocator::new(ledger.clone(), config.rpc_timeout()));
        let store = Arc::new(RecordStore::new(journal));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let retry = Arc::new(RetryScheduler::new(
            RetryPolicy::from(&config),
            queue.clone(),
            nonces.clone(),
            store.clone(),
            events.clone(),
        ));

        let (handoff, inbox) = mpsc::unbounded_channel();
        let submitter = Arc::new(Submitter::new(
            ledger.clone(),
            pool.clone(),
            nonces.clone(),
            store.clone(),
            retry.clone(),
            handoff,
            config.rpc_timeout(),
        ));
        let poller = ConfirmationPoller::new(
            ledger,
            pool.clone(),
            nonces,
            store.clone(),
            retry,
            events.clone(),
            inbox,
            config.update_period(),
            config.staleness_timeout(),
            config.rpc_timeout(),
        );

        Ok(Self {
            config,
            pool,
            queue,
            store,
            submitter,
            events,
            poller: Mutex::new(Some(poller)),
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the submission workers, the confirmation poller and the cleanup task
    pub async fn start(&self) -> RelayerResult<()> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RelayerError::AlreadyStarted)?;

        let workers = self.config.workers.unwrap_or_else(|| self.pool.size());
        let mut tasks = self.tasks.lock().await;

        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                self.queue.clone(),
                self.submitter.clone(),
                self.shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(poller.run(self.shutdown.subscribe())));

        tasks.push(tokio::spawn(cleanup_loop(
            self.store.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        )));

        info!(
            instance = %self.config.instance_id,
            workers,
            accounts = self.pool.size(),
            queue_capacity = self.queue.capacity(),
            "Transaction manager started"
        );
        Ok(())
    }

    /// Accept a request for publication.
    ///
    /// Fails with [`RelayerError::Backpressure`] when the queue is full; the
    /// request is then not tracked and the caller should retry later.
    pub async fn submit_transaction(&self, request: TransactionRequest) -> RelayerResult<TxId> {
        let tx_id = Uuid::new_v4();
        self.store.insert(tx_id, request.clone()).await;

        let queued = QueuedRequest {
            tx_id,
            request,
            retry_count: 0,
        };
        if let Err(e) = self.queue.enqueue(queued) {
            self.store.remove(tx_id).await;
            warn!(%tx_id, "Submission refused: {}", e);
            return Err(e);
        }

        debug!(%tx_id, depth = self.queue.len(), "Transaction queued");
        Ok(tx_id)
    }

    pub async fn get_status(&self, tx_id: TxId) -> RelayerResult<TxStatusView> {
        self.store
            .status(tx_id)
            .await
            .ok_or(RelayerError::TransactionNotFound { tx_id })
    }

    /// Every attempt made for a transaction, oldest first
    pub async fn attempts(&self, tx_id: TxId) -> Vec<TransactionRecord> {
        self.store.attempts(tx_id).await
    }

    /// Withdraw a transaction that is still `QUEUED`
    pub async fn cancel(&self, tx_id: TxId) -> RelayerResult<()> {
        self.store.cancel(tx_id).await?;
        // A transaction waiting out a backoff is not in the queue; its timer sees the cancel
        self.queue.remove(tx_id);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            instance_id: self.config.instance_id.clone(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            accounts_total: self.pool.size(),
            accounts_usable: self.pool.usable(),
            accounts_busy: self.pool.busy(),
            transactions: self.store.stats().await,
        }
    }

    /// Signal every task to stop and wait for them
    pub async fn stop(&self) {
        info!("Transaction manager shutdown initiated");
        self.shutdown.send_replace(true);
        self.pool.close();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Task ended abnormally: {}", e);
            }
        }
        info!("Transaction manager stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<TransactionQueue>,
    submitter: Arc<Submitter>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Submission worker started");

    loop {
        let queued = tokio::select! {
            queued = queue.dequeue() => queued,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match submitter.process(queued).await {
            Ok(outcome) => debug!(worker_id, ?outcome, "Request processed"),
            Err(RelayerError::PoolClosed) => break,
            Err(e) => error!(worker_id, "Error processing request: {}", e),
        }
    }

    debug!(worker_id, "Submission worker stopped");
}

async fn cleanup_loop(
    store: Arc<RecordStore>,
    config: RelayerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.cleanup_interval());
    // The first tick fires immediately and there is nothing to prune yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.cleanup(config.history_retention()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::fixtures;
    use crate::ledger::fake::{Behavior, FakeLedger};
    use crate::tx::{FailureReason, TxStatus};
    use ethers::types::Address;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config() -> RelayerConfig {
        RelayerConfig {
            queue_capacity: 16,
            update_period_ms: 100,
            staleness_timeout_ms: 10_000,
            retry_limit: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 60_000,
            rpc_timeout_ms: 50,
            ..RelayerConfig::default()
        }
    }

    fn manager(config: RelayerConfig, accounts: usize, ledger: Arc<FakeLedger>) -> TransactionManager {
        TransactionManager::new(config, fixtures::accounts(accounts), ledger, None).unwrap()
    }

    fn request(n: usize) -> TransactionRequest {
        TransactionRequest::new("objects", "publish", vec![serde_json::json!(n)])
    }

    async fn next_event(rx: &mut broadcast::Receiver<TxEvent>) -> TxEvent {
        timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("no event before deadline")
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_account_serializes_submissions() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        let m = manager(config(), 1, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(m.submit_transaction(request(n)).await.unwrap());
        }
        for _ in 0..3 {
            assert!(next_event(&mut events).await.is_success());
        }

        let submissions = ledger.submissions();
        let nonces: Vec<_> = submissions.iter().map(|s| s.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2]);
        // Each one waited for the previous confirmation, so at least one poll apart
        for pair in submissions.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
        }

        for id in ids {
            let view = m.get_status(id).await.unwrap();
            assert_eq!(view.status, TxStatus::Confirmed);
            assert_eq!(view.retry_count, 0);
        }
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounts_keep_independent_nonce_sequences() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        let m = manager(config(), 2, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        for n in 0..6 {
            m.submit_transaction(request(n)).await.unwrap();
        }
        for _ in 0..6 {
            assert!(next_event(&mut events).await.is_success());
        }

        let mut per_account: HashMap<Address, Vec<u64>> = HashMap::new();
        for s in ledger.submissions() {
            per_account.entry(s.signer).or_default().push(s.nonce);
        }
        assert_eq!(per_account.len(), 2);
        for nonces in per_account.values() {
            let expected: Vec<u64> = (0..nonces.len() as u64).collect();
            assert_eq!(nonces, &expected);
        }
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_in_ceil_n_over_k_rounds() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        let m = manager(config(), 2, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        let start = tokio::time::Instant::now();
        for n in 0..6 {
            m.submit_transaction(request(n)).await.unwrap();
        }
        for _ in 0..6 {
            assert!(next_event(&mut events).await.is_success());
        }

        // Six requests over two accounts: three rounds of one poll each
        assert!(start.elapsed() <= Duration::from_millis(300));

        let mut rounds: Vec<_> = ledger.submissions().iter().map(|s| s.at).collect();
        rounds.dedup();
        assert_eq!(rounds.len(), 3);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_accounts_submit_concurrently() {
        let ledger = Arc::new(FakeLedger::new(Behavior::PendingForever));
        let m = manager(config(), 2, ledger.clone());
        m.start().await.unwrap();

        m.submit_transaction(request(0)).await.unwrap();
        m.submit_transaction(request(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 2);
        assert_ne!(submissions[0].signer, submissions[1].signer);
        // Neither waited on the other's confirmation
        assert_eq!(submissions[0].at, submissions[1].at);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_transaction_backs_off_then_fails() {
        let ledger = Arc::new(FakeLedger::new(Behavior::RejectAll));
        let m = manager(config(), 1, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        let tx_id = m.submit_transaction(request(0)).await.unwrap();
        match next_event(&mut events).await {
            TxEvent::Failed {
                tx_id: id,
                retry_count,
                error,
                ..
            } => {
                assert_eq!(id, tx_id);
                assert_eq!(retry_count, 3);
                assert!(matches!(error, FailureReason::Rejected(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // One initial attempt plus exactly three retries
        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 4);
        let gaps: Vec<Duration> = submissions.windows(2).map(|p| p[1].at - p[0].at).collect();
        for (gap, min) in gaps.iter().zip([500u64, 1000, 2000]) {
            assert!(*gap >= Duration::from_millis(min));
        }
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2]);

        let view = m.get_status(tx_id).await.unwrap();
        assert_eq!(view.status, TxStatus::Failed);
        assert_eq!(view.attempts, 4);

        // Nothing further is scheduled
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ledger.submissions().len(), 4);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_transaction_fails_without_retries_left() {
        let ledger = Arc::new(FakeLedger::new(Behavior::PendingForever));
        let cfg = RelayerConfig {
            staleness_timeout_ms: 300,
            retry_limit: 0,
            ..config()
        };
        let m = manager(cfg, 1, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        let tx_id = m.submit_transaction(request(0)).await.unwrap();
        match next_event(&mut events).await {
            TxEvent::Failed { error, .. } => {
                assert!(matches!(error, FailureReason::Stale { elapsed_ms } if elapsed_ms >= 300));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(m.get_status(tx_id).await.unwrap().status, TxStatus::Failed);
        // The account came back
        assert_eq!(m.snapshot().await.accounts_busy, 0);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_status_is_retried_quietly() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        ledger.set_status_unreachable(true);
        let m = manager(config(), 1, ledger.clone());
        let mut events = m.subscribe_events();
        m.start().await.unwrap();

        let tx_id = m.submit_transaction(request(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(m.get_status(tx_id).await.unwrap().status, TxStatus::Submitted);

        ledger.set_status_unreachable(false);
        assert!(next_event(&mut events).await.is_success());
        assert_eq!(ledger.submissions().len(), 1);
        assert_eq!(m.get_status(tx_id).await.unwrap().retry_count, 0);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_backpressure_and_cancellation() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        let cfg = RelayerConfig {
            queue_capacity: 2,
            ..config()
        };
        let m = manager(cfg, 1, ledger.clone());

        let first = m.submit_transaction(request(0)).await.unwrap();
        m.submit_transaction(request(1)).await.unwrap();
        let err = m.submit_transaction(request(2)).await.unwrap_err();
        assert!(err.is_backpressure());
        assert_eq!(m.snapshot().await.transactions.total(), 2);

        m.cancel(first).await.unwrap();
        assert_eq!(m.get_status(first).await.unwrap().status, TxStatus::Cancelled);
        assert!(matches!(
            m.cancel(first).await,
            Err(RelayerError::NotCancellable { .. })
        ));

        // Cancelling freed a queue slot
        m.submit_transaction(request(2)).await.unwrap();
        assert_eq!(m.snapshot().await.queue_depth, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_transaction_is_never_submitted() {
        let ledger = Arc::new(FakeLedger::new(Behavior::ConfirmAfter(1)));
        let m = manager(config(), 1, ledger.clone());
        let mut events = m.subscribe_events();

        let dropped = m.submit_transaction(request(0)).await.unwrap();
        let kept = m.submit_transaction(request(1)).await.unwrap();
        m.cancel(dropped).await.unwrap();
        m.start().await.unwrap();

        assert_eq!(next_event(&mut events).await.tx_id(), kept);
        assert_eq!(ledger.submissions().len(), 1);
        assert!(matches!(
            m.cancel(kept).await,
            Err(RelayerError::NotCancellable { .. })
        ));
        m.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let ledger = Arc::new(FakeLedger::new(Behavior::PendingForever));
        let m = manager(config(), 1, ledger);
        m.start().await.unwrap();
        assert!(matches!(m.start().await, Err(RelayerError::AlreadyStarted)));
        m.stop().await;

        assert!(matches!(
            m.get_status(Uuid::new_v4()).await,
            Err(RelayerError::TransactionNotFound { .. })
        ));
    }
}
