// ============================================================================
// Listeners
// ============================================================================
//
// Observer hooks for transactions and for the retry engine. Every method
// has an empty default so implementors override only what they need.
// Listeners are invoked synchronously, in registration order, and never while
// the transaction's internal lock is held.
//
// ============================================================================

use super::state::LocalTransactionId;
use crate::core::{CommitType, Parameter, TransactionOption, TxError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Level, event};

/// Snapshot of a transaction handed to listeners.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub local_id: LocalTransactionId,
    /// 1-based attempt number inside a managed execution
    pub attempt: u32,
    pub option: TransactionOption,
    /// Server id, once resolved
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub trait TransactionListener: Send + Sync {
    fn transaction_id_obtained(&self, _tx: &TransactionInfo, _transaction_id: &str) {}

    fn execute_start(&self, _tx: &TransactionInfo, _execute_id: u64, _sql: &str, _params: &[Parameter]) {}

    /// `error` is `None` when the statement's outcome resolved successfully.
    fn execute_end(&self, _tx: &TransactionInfo, _execute_id: u64, _error: Option<&TxError>) {}

    fn commit_start(&self, _tx: &TransactionInfo, _commit_type: CommitType) {}

    fn commit_end(&self, _tx: &TransactionInfo, _commit_type: CommitType, _error: Option<&TxError>) {}

    fn rollback_start(&self, _tx: &TransactionInfo) {}

    fn rollback_end(&self, _tx: &TransactionInfo, _error: Option<&TxError>) {}

    fn closed(&self, _tx: &TransactionInfo, _error: Option<&TxError>) {}
}

/// Lifecycle events of one managed execution.
pub trait ManagerListener: Send + Sync {
    fn execute_start(&self, _execution_id: u64) {}

    fn transaction_start(&self, _execution_id: u64, _attempt: u32, _option: &TransactionOption) {}

    /// The attempt's server transaction id became known.
    fn transaction_started(&self, _execution_id: u64, _tx: &TransactionInfo) {}

    fn transaction_exception(&self, _execution_id: u64, _tx: &TransactionInfo, _cause: &TxError) {}

    fn transaction_rollbacked(&self, _execution_id: u64, _tx: &TransactionInfo, _error: Option<&TxError>) {}

    fn transaction_retry(
        &self,
        _execution_id: u64,
        _tx: &TransactionInfo,
        _cause: &TxError,
        _next_option: &TransactionOption,
    ) {
    }

    fn transaction_retry_over(&self, _execution_id: u64, _tx: &TransactionInfo, _cause: &TxError) {}

    /// `committed` is false when the action rolled back on its own.
    fn execute_end_success(&self, _execution_id: u64, _tx: &TransactionInfo, _committed: bool) {}

    /// `tx` is `None` when the failure happened before any transaction existed.
    fn execute_end_fail(&self, _execution_id: u64, _tx: Option<&TransactionInfo>, _error: &TxError) {}
}

/// Ordered listener registry.
pub struct Listeners<L: ?Sized> {
    entries: Vec<Arc<L>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, listener: Arc<L>) {
        self.entries.push(listener);
    }

    pub fn extend(&mut self, other: &Listeners<L>) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&self, f: impl Fn(&L)) {
        for listener in &self.entries {
            f(listener);
        }
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> Clone for Listeners<L> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// Emits every event as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl TransactionListener for TracingListener {
    fn transaction_id_obtained(&self, tx: &TransactionInfo, transaction_id: &str) {
        event!(Level::DEBUG, local_id = %tx.local_id, transaction_id, "transaction started");
    }

    fn execute_start(&self, tx: &TransactionInfo, execute_id: u64, sql: &str, params: &[Parameter]) {
        event!(
            Level::TRACE,
            local_id = %tx.local_id,
            execute_id,
            sql,
            params = params.len(),
            "execute start"
        );
    }

    fn execute_end(&self, tx: &TransactionInfo, execute_id: u64, error: Option<&TxError>) {
        match error {
            Some(error) => event!(Level::DEBUG, local_id = %tx.local_id, execute_id, error = %error, "execute failed"),
            None => event!(Level::TRACE, local_id = %tx.local_id, execute_id, "execute end"),
        }
    }

    fn commit_end(&self, tx: &TransactionInfo, commit_type: CommitType, error: Option<&TxError>) {
        event!(
            Level::DEBUG,
            local_id = %tx.local_id,
            commit_type = ?commit_type,
            ok = error.is_none(),
            "commit end"
        );
    }

    fn rollback_end(&self, tx: &TransactionInfo, error: Option<&TxError>) {
        event!(Level::DEBUG, local_id = %tx.local_id, ok = error.is_none(), "rollback end");
    }

    fn closed(&self, tx: &TransactionInfo, error: Option<&TxError>) {
        if let Some(error) = error {
            event!(Level::WARN, local_id = %tx.local_id, error = %error, "transaction close failed");
        }
    }
}

impl ManagerListener for TracingListener {
    fn execute_start(&self, execution_id: u64) {
        event!(Level::DEBUG, execution_id, "managed execution start");
    }

    fn transaction_exception(&self, execution_id: u64, tx: &TransactionInfo, cause: &TxError) {
        event!(
            Level::DEBUG,
            execution_id,
            attempt = tx.attempt,
            error = %cause,
            "attempt aborted"
        );
    }

    fn transaction_retry(
        &self,
        execution_id: u64,
        tx: &TransactionInfo,
        _cause: &TxError,
        next_option: &TransactionOption,
    ) {
        event!(
            Level::INFO,
            execution_id,
            attempt = tx.attempt,
            next_option = %next_option,
            "retrying transaction"
        );
    }

    fn transaction_retry_over(&self, execution_id: u64, tx: &TransactionInfo, cause: &TxError) {
        event!(
            Level::WARN,
            execution_id,
            attempt = tx.attempt,
            error = %cause,
            "retry over"
        );
    }

    fn execute_end_success(&self, execution_id: u64, tx: &TransactionInfo, committed: bool) {
        event!(Level::DEBUG, execution_id, attempt = tx.attempt, committed, "managed execution end");
    }

    fn execute_end_fail(&self, execution_id: u64, _tx: Option<&TransactionInfo>, error: &TxError) {
        event!(Level::DEBUG, execution_id, error = %error, "managed execution failed");
    }
}
