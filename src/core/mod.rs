pub mod diagnostic;
pub mod error;
pub mod types;
pub mod value;

pub use diagnostic::{
    ClientCode, DefaultDiagnosticCodeProvider, DiagnosticCode, DiagnosticCodeProvider,
    ServerCategory, ServerCode,
};
pub use error::{AttemptContext, ErrorKind, Result, TxError};
pub use types::{CommitType, OperationKind, Row, TimeoutPhase, TransactionKind, TransactionOption};
pub use value::{Parameter, Value};
