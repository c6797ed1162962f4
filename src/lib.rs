// ============================================================================
// txexec Library
// ============================================================================
//
// Synchronous, retry-aware transaction execution over an asynchronous SQL
// service:
//
// - session: timeout policies, timeout-bounded resolution of pending
//   responses, and the resource hierarchy (session > transaction > result)
// - transaction: the `Transaction` facade and the `TransactionManager` retry
//   engine
// - service: the asynchronous service boundary and a scripted in-memory
//   implementation
//
// ============================================================================

pub mod core;
pub mod prelude;
pub mod result;
pub mod service;
pub mod session;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{
    AttemptContext, ClientCode, CommitType, DiagnosticCode, DiagnosticCodeProvider, ErrorKind,
    OperationKind, Parameter, Result, Row, ServerCategory, ServerCode, TransactionKind,
    TransactionOption, TxError, Value,
};
pub use crate::result::{ResultHandle, ResultStatus, RowStream};
pub use crate::service::{ExecuteOutcome, FutureResponse, PendingResponse, SqlService};
pub use crate::session::{Interrupter, Session, SessionBuilder, SessionOptions, TimeoutKey};
pub use crate::transaction::{
    FixedOption, ManagerListener, ManagerSettings, RetryDecision, Transaction, TransactionListener,
    TransactionManager, TransactionOptionSupplier,
};
