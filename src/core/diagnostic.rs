// ============================================================================
// Diagnostic Codes
// ============================================================================
//
// Structured identifiers for every failure the layer can report. Client codes
// are produced locally; server codes are defined by the SQL service and only
// carried through. Retry classification looks at the server category.
//
// ============================================================================

use super::error::TxError;
use super::types::{OperationKind, TimeoutPhase};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-defined grouping used for retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerCategory {
    /// Conflict or serialization failure; the only retryable category
    Serialization,
    Syntax,
    Constraint,
    Connection,
    InactiveTransaction,
    Other,
}

/// Code reported by the SQL service, e.g. `SQL-04000 (CC_EXCEPTION)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerCode {
    pub prefix: String,
    pub number: u32,
    pub name: String,
    pub category: ServerCategory,
}

impl ServerCode {
    pub fn new(
        prefix: impl Into<String>,
        number: u32,
        name: impl Into<String>,
        category: ServerCategory,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            number,
            name: name.into(),
            category,
        }
    }

    pub fn structured_code(&self) -> String {
        format!("{}-{:05}", self.prefix, self.number)
    }

    pub fn cc_exception() -> Self {
        Self::new("SQL", 4000, "CC_EXCEPTION", ServerCategory::Serialization)
    }

    pub fn occ_read_exception() -> Self {
        Self::new("SQL", 4010, "OCC_READ_EXCEPTION", ServerCategory::Serialization)
    }

    pub fn conflict_on_write_preserve() -> Self {
        Self::new(
            "SQL",
            4015,
            "CONFLICT_ON_WRITE_PRESERVE_EXCEPTION",
            ServerCategory::Serialization,
        )
    }

    pub fn syntax_error() -> Self {
        Self::new("SQL", 3001, "SYNTAX_EXCEPTION", ServerCategory::Syntax)
    }

    pub fn unique_constraint_violation() -> Self {
        Self::new(
            "SQL",
            2002,
            "UNIQUE_CONSTRAINT_VIOLATION_EXCEPTION",
            ServerCategory::Constraint,
        )
    }

    pub fn inactive_transaction() -> Self {
        Self::new(
            "SQL",
            2025,
            "INACTIVE_TRANSACTION_EXCEPTION",
            ServerCategory::InactiveTransaction,
        )
    }

    pub fn connection_failure() -> Self {
        Self::new("SCD", 1, "BROKEN_CONNECTION", ServerCategory::Connection)
    }
}

impl fmt::Display for ServerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.structured_code(), self.name)
    }
}

/// Codes produced by this crate without contacting the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientCode {
    Timeout {
        operation: OperationKind,
        phase: TimeoutPhase,
    },
    Interrupted,
    AlreadyClosed,
    AlreadyFinished,
    RetryOver,
    NotRetryable,
    CloseFailed,
    Lock,
    Config,
    Internal,
}

impl fmt::Display for ClientCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { operation, phase } => write!(f, "{}_{}_TIMEOUT", operation, phase),
            Self::Interrupted => write!(f, "INTERRUPTED"),
            Self::AlreadyClosed => write!(f, "ALREADY_CLOSED"),
            Self::AlreadyFinished => write!(f, "ALREADY_FINISHED"),
            Self::RetryOver => write!(f, "TM_RETRY_OVER"),
            Self::NotRetryable => write!(f, "TM_NOT_RETRYABLE"),
            Self::CloseFailed => write!(f, "CLOSE_FAILED"),
            Self::Lock => write!(f, "LOCK_POISONED"),
            Self::Config => write!(f, "INVALID_CONFIG"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    Client(ClientCode),
    Server(ServerCode),
}

impl DiagnosticCode {
    pub fn server_category(&self) -> Option<ServerCategory> {
        match self {
            Self::Server(code) => Some(code.category),
            Self::Client(_) => None,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(code) => write!(f, "CLIENT-{}", code),
            Self::Server(code) => write!(f, "{}", code),
        }
    }
}

impl From<ClientCode> for DiagnosticCode {
    fn from(code: ClientCode) -> Self {
        Self::Client(code)
    }
}

impl From<ServerCode> for DiagnosticCode {
    fn from(code: ServerCode) -> Self {
        Self::Server(code)
    }
}

/// Maps an error to the code used for messages and retry classification.
pub trait DiagnosticCodeProvider: Send + Sync {
    fn find(&self, error: &TxError) -> DiagnosticCode;
}

/// Prefers a server-reported code anywhere in the cause chain and falls back
/// to the error's own code.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDiagnosticCodeProvider;

impl DiagnosticCodeProvider for DefaultDiagnosticCodeProvider {
    fn find(&self, error: &TxError) -> DiagnosticCode {
        match error.find_server_code() {
            Some(code) => DiagnosticCode::Server(code.clone()),
            None => error.code().clone(),
        }
    }
}

impl<F> DiagnosticCodeProvider for F
where
    F: Fn(&TxError) -> DiagnosticCode + Send + Sync,
{
    fn find(&self, error: &TxError) -> DiagnosticCode {
        self(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_display() {
        assert_eq!(
            ServerCode::cc_exception().to_string(),
            "SQL-04000 (CC_EXCEPTION)"
        );
        let timeout = ClientCode::Timeout {
            operation: OperationKind::Begin,
            phase: TimeoutPhase::Connect,
        };
        assert_eq!(
            DiagnosticCode::from(timeout).to_string(),
            "CLIENT-TX_BEGIN_CONNECT_TIMEOUT"
        );
    }

    #[test]
    fn test_default_provider_unwraps_server_cause() {
        let server = TxError::server(ServerCode::occ_read_exception(), "read conflict");
        let wrapped = TxError::internal("action failed").with_cause(server);

        let code = DefaultDiagnosticCodeProvider.find(&wrapped);
        assert_eq!(code.server_category(), Some(ServerCategory::Serialization));

        let local = TxError::already_closed("result");
        assert_eq!(
            DefaultDiagnosticCodeProvider.find(&local),
            DiagnosticCode::Client(ClientCode::AlreadyClosed)
        );
    }
}
