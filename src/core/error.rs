use super::diagnostic::{ClientCode, DiagnosticCode, ServerCode};
use super::types::{OperationKind, TimeoutPhase, TransactionOption};
use std::fmt;
use thiserror::Error;

/// Failure taxonomy shared by every operation in the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A bounded wait ran out of time
    Timeout {
        operation: OperationKind,
        phase: TimeoutPhase,
    },
    /// The service returned a structured diagnostic code
    ServerReported,
    /// Operation on a resource that is already closed
    AlreadyClosed,
    /// Commit/rollback/execute on a transaction past its finish
    AlreadyFinished,
    /// The retry engine spent its attempt budget
    RetryOver,
    /// One or more child resources failed to close
    AggregatedClose,
    /// The waiting call was interrupted
    Interrupted,
    Lock,
    Config,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { operation, phase } => write!(f, "{} {} timeout", operation, phase),
            Self::ServerReported => write!(f, "server error"),
            Self::AlreadyClosed => write!(f, "already closed"),
            Self::AlreadyFinished => write!(f, "already finished"),
            Self::RetryOver => write!(f, "retry over"),
            Self::AggregatedClose => write!(f, "close failed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Lock => write!(f, "lock error"),
            Self::Config => write!(f, "configuration error"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// Where in a managed execution a failure surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub transaction_id: Option<String>,
    pub attempt: u32,
    pub option: TransactionOption,
    /// Option the engine would have tried next (retry over only)
    pub next_option: Option<TransactionOption>,
}

impl fmt::Display for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transactionId={}, attempt={}, option={}",
            self.transaction_id.as_deref().unwrap_or("<unknown>"),
            self.attempt,
            self.option
        )?;
        if let Some(next) = &self.next_option {
            write!(f, ", nextOption={}", next)?;
        }
        Ok(())
    }
}

fn render_context(context: &Option<AttemptContext>) -> String {
    match context {
        Some(context) => format!(" ({})", context),
        None => String::new(),
    }
}

/// Error returned by every fallible operation.
///
/// A single type with a `kind` discriminator, the structured diagnostic
/// code, an optional wrapped cause and the secondary failures collected
/// during cleanup.
#[derive(Error, Debug, Clone)]
#[error("{kind} [{code}]: {message}{}", render_context(.context))]
pub struct TxError {
    kind: ErrorKind,
    code: DiagnosticCode,
    message: String,
    #[source]
    cause: Option<Box<TxError>>,
    suppressed: Vec<TxError>,
    context: Option<AttemptContext>,
}

pub type Result<T> = std::result::Result<T, TxError>;

impl TxError {
    pub fn new(kind: ErrorKind, code: impl Into<DiagnosticCode>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
            context: None,
        }
    }

    pub fn server(code: ServerCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerReported, code, message)
    }

    pub fn timeout(operation: OperationKind, phase: TimeoutPhase) -> Self {
        Self::new(
            ErrorKind::Timeout { operation, phase },
            ClientCode::Timeout { operation, phase },
            format!("{} {} timed out", operation, phase.to_string().to_lowercase()),
        )
    }

    pub fn interrupted(operation: OperationKind) -> Self {
        Self::new(
            ErrorKind::Interrupted,
            ClientCode::Interrupted,
            format!("wait for {} was interrupted", operation),
        )
    }

    pub fn already_closed(what: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyClosed,
            ClientCode::AlreadyClosed,
            format!("{} already closed", what),
        )
    }

    pub fn already_finished(what: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyFinished,
            ClientCode::AlreadyFinished,
            format!("{} already finished", what),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, ClientCode::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, ClientCode::Internal, message)
    }

    /// Terminal error of a managed execution that spent its attempt budget.
    pub fn retry_over(cause: TxError, context: AttemptContext) -> Self {
        Self::new(
            ErrorKind::RetryOver,
            ClientCode::RetryOver,
            format!("retry over after {} attempt(s)", context.attempt),
        )
        .with_cause(cause)
        .with_context(context)
    }

    /// Collapse a list of close failures into one error. The first failure
    /// becomes the cause and the rest are attached as suppressed.
    pub fn aggregate(mut errors: Vec<TxError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let primary = errors.remove(0);
        let mut aggregated = Self::new(
            ErrorKind::AggregatedClose,
            ClientCode::CloseFailed,
            format!("{} resource(s) failed to close", errors.len() + 1),
        )
        .with_cause(primary);
        aggregated.suppressed = errors;
        Some(aggregated)
    }

    pub fn with_cause(mut self, cause: TxError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_suppressed(mut self, error: TxError) -> Self {
        self.suppressed.push(error);
        self
    }

    pub fn add_suppressed(&mut self, error: TxError) {
        self.suppressed.push(error);
    }

    pub fn with_context(mut self, context: AttemptContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn code(&self) -> &DiagnosticCode {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&TxError> {
        self.cause.as_deref()
    }

    pub fn suppressed(&self) -> &[TxError] {
        &self.suppressed
    }

    pub fn context(&self) -> Option<&AttemptContext> {
        self.context.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout { .. })
    }

    pub fn is_server_reported(&self) -> bool {
        self.kind == ErrorKind::ServerReported
    }

    /// First server-reported code found on this error or its causes.
    pub fn find_server_code(&self) -> Option<&ServerCode> {
        let mut current = Some(self);
        while let Some(error) = current {
            if let DiagnosticCode::Server(code) = &error.code {
                return Some(code);
            }
            current = error.cause();
        }
        None
    }
}

impl<T> From<std::sync::PoisonError<T>> for TxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::new(ErrorKind::Lock, ClientCode::Lock, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_keeps_first_as_cause() {
        let errors = vec![
            TxError::internal("first"),
            TxError::internal("second"),
            TxError::internal("third"),
        ];
        let aggregated = TxError::aggregate(errors).unwrap();

        assert_eq!(aggregated.kind(), &ErrorKind::AggregatedClose);
        assert_eq!(aggregated.cause().unwrap().message(), "first");
        assert_eq!(aggregated.suppressed().len(), 2);
        assert!(TxError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TxError::internal("boom").with_context(AttemptContext {
            transaction_id: Some("tx-1".into()),
            attempt: 2,
            option: TransactionOption::occ(),
            next_option: Some(TransactionOption::ltx(["t"])),
        });
        let text = err.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("transactionId=tx-1"));
        assert!(text.contains("attempt=2"));
        assert!(text.contains("nextOption=LTX{writePreserve=[t]}"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;

        let err = TxError::internal("outer")
            .with_cause(TxError::server(ServerCode::syntax_error(), "bad sql"));
        let source = err.source().unwrap();
        assert!(source.to_string().contains("bad sql"));
        assert_eq!(err.find_server_code(), Some(&ServerCode::syntax_error()));
    }
}
