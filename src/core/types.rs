use serde::{Deserialize, Serialize};
use std::fmt;

use super::Value;

pub type Row = Vec<Value>;

/// Kind of blocking operation issued against the SQL service.
///
/// Every kind resolves its wait under a "connect" timeout key and its
/// cleanup under a "close" timeout key (see `TimeoutKey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Begin,
    Result,
    Commit,
    Rollback,
    Status,
    Explain,
    SystemInfo,
    TransactionClose,
    Statement,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Begin => "TX_BEGIN",
            Self::Result => "RESULT",
            Self::Commit => "TX_COMMIT",
            Self::Rollback => "TX_ROLLBACK",
            Self::Status => "TX_STATUS",
            Self::Explain => "EXPLAIN",
            Self::SystemInfo => "SYSTEM_INFO",
            Self::TransactionClose => "TX_CLOSE",
            Self::Statement => "STATEMENT",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which half of a bounded wait ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutPhase {
    Connect,
    Close,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "CONNECT"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// Execution mode requested from the service when a transaction begins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Optimistic concurrency control
    Occ,
    /// Long transaction; writes must be declared up front
    Ltx { write_preserve: Vec<String> },
    /// Read-only
    Rtx,
    /// Long transaction allowed to run DDL
    Ddl,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occ => write!(f, "OCC"),
            Self::Ltx { write_preserve } => {
                write!(f, "LTX{{writePreserve=[{}]}}", write_preserve.join(", "))
            }
            Self::Rtx => write!(f, "RTX"),
            Self::Ddl => write!(f, "DDL"),
        }
    }
}

/// Immutable transaction option: an execution mode plus an optional label
/// that the service shows in its own diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionOption {
    kind: TransactionKind,
    label: Option<String>,
}

impl TransactionOption {
    pub fn new(kind: TransactionKind) -> Self {
        Self { kind, label: None }
    }

    pub fn occ() -> Self {
        Self::new(TransactionKind::Occ)
    }

    pub fn ltx<I, S>(write_preserve: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(TransactionKind::Ltx {
            write_preserve: write_preserve.into_iter().map(Into::into).collect(),
        })
    }

    pub fn rtx() -> Self {
        Self::new(TransactionKind::Rtx)
    }

    pub fn ddl() -> Self {
        Self::new(TransactionKind::Ddl)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, TransactionKind::Rtx)
    }
}

impl fmt::Display for TransactionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}(label={})", self.kind, label),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Durability level the commit waits for before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommitType {
    /// Let the service decide
    #[default]
    Default,
    Accepted,
    Available,
    Stored,
    Propagated,
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "DEFAULT",
            Self::Accepted => "ACCEPTED",
            Self::Available => "AVAILABLE",
            Self::Stored => "STORED",
            Self::Propagated => "PROPAGATED",
        };
        f.write_str(name)
    }
}
