//! Common imports for application code.
//!
//! ```ignore
//! use txexec::prelude::*;
//! ```

pub use crate::core::{
    CommitType, ErrorKind, Parameter, Result, Row, TransactionOption, TxError, Value,
};
pub use crate::result::{ResultHandle, RowStream};
pub use crate::session::{Session, SessionOptions, TimeoutKey};
pub use crate::transaction::{
    Escalating, FixedOption, ManagerSettings, OptionSequence, Transaction, TransactionManager,
};
