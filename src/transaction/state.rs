// ============================================================================
// Transaction State Management
// ============================================================================
//
// Client-side lifecycle of a transaction:
//
//   Created ──id resolved──> Started ──commit──> Committed ──┐
//      │                        │                            ├──close──> Closed
//      │                        └──rollback──> RolledBack ───┘
//      └───────────────────────────────close───────────────────────────> Closed
//
// Commit and rollback are each accepted at most once. A failed commit still
// permits one rollback; nothing is accepted after close.
//
// ============================================================================

use crate::core::{Result, TxError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global local-id counter
static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id assigned when the transaction object is created, before
/// the server id is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalTransactionId(pub u64);

impl LocalTransactionId {
    pub fn new() -> Self {
        LocalTransactionId(NEXT_LOCAL_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for LocalTransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalTransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local-tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Begin submitted, server id not yet resolved
    Created,
    Started,
    Committed,
    RolledBack,
    Closed,
}

impl TransactionState {
    /// Commit or rollback completed successfully
    pub fn is_finished(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransactionState::Closed)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Created => write!(f, "CREATED"),
            TransactionState::Started => write!(f, "STARTED"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    Commit,
    Rollback,
}

/// Guards every transition; the owning transaction holds it under a lock.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: TransactionState,
    requested: Option<Finish>,
    closing: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Created,
            requested: None,
            closing: false,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn requested(&self) -> Option<Finish> {
        self.requested
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closing || self.state.is_closed() {
            return Err(TxError::already_closed("transaction"));
        }
        Ok(())
    }

    /// Statements are accepted until a commit or rollback is requested.
    pub fn check_active(&self) -> Result<()> {
        self.check_open()?;
        if self.state.is_finished() || self.requested.is_some() {
            return Err(TxError::already_finished("transaction"));
        }
        Ok(())
    }

    pub fn request_commit(&mut self) -> Result<()> {
        self.check_active()?;
        self.requested = Some(Finish::Commit);
        Ok(())
    }

    pub fn request_rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if self.state.is_finished() || self.requested == Some(Finish::Rollback) {
            return Err(TxError::already_finished("transaction"));
        }
        self.requested = Some(Finish::Rollback);
        Ok(())
    }

    pub fn started(&mut self) {
        if self.state == TransactionState::Created {
            self.state = TransactionState::Started;
        }
    }

    pub fn committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub fn rolled_back(&mut self) {
        self.state = TransactionState::RolledBack;
    }

    /// Returns false if a close is already under way or done.
    pub fn begin_close(&mut self) -> bool {
        if self.closing || self.state.is_closed() {
            return false;
        }
        self.closing = true;
        true
    }

    pub fn closed(&mut self) {
        self.state = TransactionState::Closed;
    }
}
