// ============================================================================
// Transaction Module
// ============================================================================
//
// Synchronous transactions over the asynchronous service, plus the retry
// engine that runs user actions in them.
//
// - state: client-side lifecycle and local ids
// - transaction: the `Transaction` facade
// - listener: observer hooks
// - policy: retry decisions and manager settings
// - manager: the retry engine
//
// ============================================================================

pub mod listener;
pub mod manager;
pub mod policy;
pub mod state;
#[allow(clippy::module_inception)]
pub mod transaction;

pub use listener::{Listeners, ManagerListener, TracingListener, TransactionInfo, TransactionListener};
pub use manager::TransactionManager;
pub use policy::{
    Backoff, ConflictClassifier, DecideFn, Escalating, FixedOption, GiveUp, ManagerSettings,
    OptionSequence, RetryClassifier, RetryDecision, TransactionOptionSupplier,
};
pub use state::{LocalTransactionId, TransactionState};
pub use transaction::Transaction;
