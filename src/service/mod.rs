// ============================================================================
// SQL Service Boundary
// ============================================================================
//
// The asynchronous service this crate drives. Every request is submitted
// immediately and answered through a `PendingResponse`, which is independently
// closeable so server-side resources can be reclaimed on timeout or cleanup.
//
// ============================================================================

pub mod scripted;

use crate::core::{CommitType, Parameter, Result, ServerCode, TransactionOption};
use crate::result::RowStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use scripted::{CloseReply, Reply, ScriptedService};

/// A cancellable, closeable answer to one submitted request.
#[async_trait]
pub trait FutureResponse<T: Send>: Send {
    /// Wait for the outcome. Called at most once per response.
    async fn get(&mut self) -> Result<T>;

    /// Release whatever the service holds for this request.
    async fn close(&mut self) -> Result<()>;
}

pub type PendingResponse<T> = Box<dyn FutureResponse<T>>;

/// Opaque server-side transaction handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionHandle {
    id: String,
}

impl TransactionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterType {
    InsertedRows,
    UpdatedRows,
    MergedRows,
    DeletedRows,
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    counters: Vec<(CounterType, u64)>,
}

impl ExecuteOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(mut self, counter: CounterType, rows: u64) -> Self {
        self.counters.push((counter, rows));
        self
    }

    pub fn counters(&self) -> &[(CounterType, u64)] {
        &self.counters
    }

    pub fn counter(&self, counter: CounterType) -> Option<u64> {
        self.counters
            .iter()
            .filter(|(kind, _)| *kind == counter)
            .map(|(_, rows)| *rows)
            .reduce(|a, b| a + b)
    }

    /// Total rows touched, or `None` when the service reported no counter.
    pub fn updated_count(&self) -> Option<u64> {
        self.counters.iter().map(|(_, rows)| *rows).reduce(|a, b| a + b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerTransactionState {
    Unknown,
    Running,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Server view of a transaction, including the abort reason if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub state: ServerTransactionState,
    pub diagnostic: Option<ServerCode>,
    pub message: Option<String>,
}

impl TransactionStatus {
    pub fn running() -> Self {
        Self {
            state: ServerTransactionState::Running,
            diagnostic: None,
            message: None,
        }
    }

    pub fn aborted(code: ServerCode, message: impl Into<String>) -> Self {
        Self {
            state: ServerTransactionState::Aborted,
            diagnostic: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.diagnostic.is_some()
    }
}

/// Explain output, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementMetadata {
    pub format_id: String,
    pub format_version: u32,
    pub contents: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
}

/// Asynchronous SQL service primitives over one session.
///
/// Implementations must tolerate concurrent use from several transactions.
pub trait SqlService: Send + Sync {
    fn begin_transaction(
        &self,
        option: &TransactionOption,
    ) -> Result<PendingResponse<TransactionHandle>>;

    fn execute_statement(
        &self,
        tx: &TransactionHandle,
        sql: &str,
        params: &[Parameter],
    ) -> Result<PendingResponse<ExecuteOutcome>>;

    fn execute_query(
        &self,
        tx: &TransactionHandle,
        sql: &str,
        params: &[Parameter],
    ) -> Result<PendingResponse<RowStream>>;

    fn commit(
        &self,
        tx: &TransactionHandle,
        commit_type: CommitType,
    ) -> Result<PendingResponse<()>>;

    fn rollback(&self, tx: &TransactionHandle) -> Result<PendingResponse<()>>;

    fn transaction_status(
        &self,
        tx: &TransactionHandle,
    ) -> Result<PendingResponse<TransactionStatus>>;

    fn explain(&self, sql: &str, params: &[Parameter])
    -> Result<PendingResponse<StatementMetadata>>;

    fn system_info(&self) -> Result<PendingResponse<SystemInfo>>;

    /// Release the server-side transaction handle.
    fn dispose_transaction(&self, tx: &TransactionHandle) -> Result<PendingResponse<()>>;
}
