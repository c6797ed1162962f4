// ============================================================================
// Session
// ============================================================================
//
// Entry point: binds a `SqlService` to a runtime, a timeout table and the
// set of transactions opened through it. Closing the session closes every
// transaction still open, which in turn closes their results.
//
// ============================================================================

pub mod options;
pub mod resolver;
pub mod tracker;

pub use options::{SessionOptions, TimeoutConfig, TimeoutKey, TimeoutPolicy};
pub use resolver::{AsyncResolver, ExecutionRuntime, Interrupter};
pub use tracker::{ResourceId, ResourceTracker, ServerResource, TrackedBy};

use crate::core::{OperationKind, Result, TransactionOption, TxError};
use crate::service::{SqlService, SystemInfo};
use crate::transaction::{Listeners, Transaction, TransactionListener};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{Level, event};

struct SessionInner {
    service: Arc<dyn SqlService>,
    resolver: AsyncResolver,
    transactions: Arc<ResourceTracker>,
    listeners: Listeners<dyn TransactionListener>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for error in self.transactions.close_all() {
            event!(Level::WARN, error = %error, "closing transaction on session drop failed");
        }
    }
}

/// Cheaply cloneable handle; clones share the same transactions.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub struct SessionBuilder {
    service: Arc<dyn SqlService>,
    options: SessionOptions,
    runtime: Option<Handle>,
    listeners: Listeners<dyn TransactionListener>,
}

impl SessionBuilder {
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Drive responses on an existing runtime instead of a dedicated one.
    ///
    /// Blocking calls made from inside a current-thread runtime fail with
    /// `ErrorKind::Config`; use a multi-thread runtime there.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Listener attached to every transaction the session creates.
    pub fn listener(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn build(self) -> Result<Session> {
        let runtime = match self.runtime {
            Some(handle) => ExecutionRuntime::Borrowed(handle),
            None => ExecutionRuntime::owned()?,
        };
        let label = self
            .options
            .session_label()
            .unwrap_or("session")
            .to_string();
        event!(Level::DEBUG, label = %label, "session opened");

        Ok(Session {
            inner: Arc::new(SessionInner {
                service: self.service,
                resolver: AsyncResolver::new(Arc::new(runtime), self.options, Interrupter::new()),
                transactions: Arc::new(ResourceTracker::new(label)),
                listeners: self.listeners,
            }),
        })
    }
}

impl Session {
    pub fn builder(service: Arc<dyn SqlService>) -> SessionBuilder {
        SessionBuilder {
            service,
            options: SessionOptions::default(),
            runtime: None,
            listeners: Listeners::new(),
        }
    }

    /// Session with default options and a dedicated runtime.
    pub fn connect(service: Arc<dyn SqlService>) -> Result<Self> {
        Self::builder(service).build()
    }

    pub fn options(&self) -> &SessionOptions {
        self.inner.resolver.options()
    }

    pub fn resolver(&self) -> &AsyncResolver {
        &self.inner.resolver
    }

    /// Interrupts every resolution currently blocked on this session.
    pub fn interrupter(&self) -> Interrupter {
        self.inner.resolver.interrupter().clone()
    }

    pub fn service(&self) -> &Arc<dyn SqlService> {
        &self.inner.service
    }

    /// Begin a transaction outside the retry engine.
    pub fn create_transaction(&self, option: TransactionOption) -> Result<Transaction> {
        self.begin_attempt(option, 1, &Listeners::new())
    }

    pub(crate) fn begin_attempt(
        &self,
        option: TransactionOption,
        attempt: u32,
        extra: &Listeners<dyn TransactionListener>,
    ) -> Result<Transaction> {
        if self.inner.transactions.is_closed() {
            return Err(TxError::already_closed("session"));
        }

        let mut listeners = self.inner.listeners.clone();
        listeners.extend(extra);
        let tx = Transaction::begin(
            Arc::clone(&self.inner.service),
            self.inner.resolver.clone(),
            option,
            attempt,
            listeners,
        )?;
        let tracked = self.inner.transactions.register(tx.as_resource())?;
        tx.attach(tracked);
        Ok(tx)
    }

    pub fn system_info(&self) -> Result<SystemInfo> {
        let pending = self.inner.service.system_info()?;
        self.inner.resolver.resolve(pending, OperationKind::SystemInfo)
    }

    /// Transactions created through this session and not yet closed.
    pub fn open_transactions(&self) -> usize {
        self.inner.transactions.len()
    }

    /// Close every open transaction; later `create_transaction` calls fail.
    /// Idempotent.
    ///
    /// # Errors
    /// The aggregated transaction close failures.
    pub fn close(&self) -> Result<()> {
        self.inner.transactions.close_all_with(|| Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.transactions.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::service::ScriptedService;

    #[test]
    fn test_close_closes_open_transactions() {
        let service = Arc::new(ScriptedService::new());
        let session = Session::connect(Arc::clone(&service) as Arc<dyn SqlService>).unwrap();

        let tx1 = session.create_transaction(TransactionOption::occ()).unwrap();
        let tx2 = session.create_transaction(TransactionOption::rtx()).unwrap();
        tx1.transaction_id().unwrap();
        assert_eq!(session.open_transactions(), 2);

        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(session.open_transactions(), 0);
        assert!(tx2.state().is_closed());
        assert_eq!(service.open_responses(), 0);

        let err = session
            .create_transaction(TransactionOption::occ())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AlreadyClosed);
    }

    #[test]
    fn test_closed_transaction_deregisters() {
        let service = Arc::new(ScriptedService::new());
        let session = Session::connect(service as Arc<dyn SqlService>).unwrap();

        let tx = session.create_transaction(TransactionOption::occ()).unwrap();
        tx.close().unwrap();
        assert_eq!(session.open_transactions(), 0);

        drop(session.create_transaction(TransactionOption::occ()).unwrap());
        assert_eq!(session.open_transactions(), 0);
    }

    #[test]
    fn test_system_info() {
        let service = Arc::new(ScriptedService::new());
        let session = Session::connect(service as Arc<dyn SqlService>).unwrap();
        assert_eq!(session.system_info().unwrap().name, "scripted");
    }
}
