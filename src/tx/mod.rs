//! Transaction pipeline: queueing, nonce allocation, submission,
//! confirmation polling and retries

pub mod nonce;
pub mod poller;
pub mod queue;
pub mod record;
pub mod retry;
pub mod sender;

pub use nonce::NonceAllocator;
pub use poller::{ConfirmationPoller, InFlight, PollSummary};
pub use queue::{QueuedRequest, TransactionQueue};
pub use record::{
    Confirmation, FailureReason, RecordId, TransactionRecord, TransactionRequest, TxId, TxStatus,
    TxStatusView,
};
pub use retry::{FailedAttempt, RetryDecision, RetryPolicy, RetryScheduler};
pub use sender::{SignedTransaction, SubmitOutcome, Submitter};
