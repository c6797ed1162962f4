// ============================================================================
// Transaction
// ============================================================================
//
// Synchronous facade over one server transaction. Every server interaction
// is submitted asynchronously and resolved through the session's resolver,
// so each one is bounded by its own timeout. Results executed through the
// transaction are tracked and reclaimed when the transaction closes.
//
// ============================================================================

use super::listener::{Listeners, TransactionInfo, TransactionListener};
use super::state::{Finish, Lifecycle, LocalTransactionId, TransactionState};
use crate::core::{CommitType, OperationKind, Parameter, Result, Row, TransactionOption, TxError};
use crate::result::handle::SettleHook;
use crate::result::{ResultHandle, RowStream};
use crate::service::{
    ExecuteOutcome, PendingResponse, SqlService, StatementMetadata, TransactionHandle,
    TransactionStatus,
};
use crate::session::resolver::{AsyncResolver, CloseSignal};
use crate::session::tracker::{ResourceTracker, ServerResource, TrackedBy};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use tracing::{Level, event};

struct Inner {
    lifecycle: Lifecycle,
    /// Begin response, until the server id is resolved
    begin: Option<PendingResponse<TransactionHandle>>,
    /// Set while one caller waits on the begin response outside the lock
    begin_resolving: bool,
    begin_error: Option<TxError>,
    handle: Option<TransactionHandle>,
}

struct TransactionCore {
    local_id: LocalTransactionId,
    attempt: u32,
    option: TransactionOption,
    created_at: DateTime<Utc>,
    service: Arc<dyn SqlService>,
    resolver: AsyncResolver,
    listeners: Listeners<dyn TransactionListener>,
    children: Arc<ResourceTracker>,
    inner: Mutex<Inner>,
    begin_done: Condvar,
    closing: CloseSignal,
    next_execute_id: AtomicU64,
    tracked: OnceLock<TrackedBy>,
}

impl TransactionCore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn info(&self) -> TransactionInfo {
        let transaction_id = self.lock().handle.as_ref().map(|h| h.id().to_string());
        TransactionInfo {
            local_id: self.local_id,
            attempt: self.attempt,
            option: self.option.clone(),
            transaction_id,
            created_at: self.created_at,
        }
    }

    /// Server handle, resolving the begin response on first use.
    ///
    /// The wait runs without the lock held; concurrent callers block until
    /// it settles. Closing the transaction ends the wait.
    fn handle(&self) -> Result<TransactionHandle> {
        let pending = {
            let mut inner = self.lock();
            loop {
                inner.lifecycle.check_open()?;
                if let Some(handle) = &inner.handle {
                    return Ok(handle.clone());
                }
                if let Some(error) = &inner.begin_error {
                    return Err(error.clone());
                }
                if !inner.begin_resolving {
                    break;
                }
                inner = self
                    .begin_done
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            let pending = inner
                .begin
                .take()
                .ok_or_else(|| TxError::internal("begin response already consumed"))?;
            inner.begin_resolving = true;
            pending
        };

        let resolved = self
            .resolver
            .resolve_or_close(pending, OperationKind::Begin, &self.closing);

        let (outcome, orphan) = {
            let mut inner = self.lock();
            inner.begin_resolving = false;
            let settled = match resolved {
                // Closed while waiting: the close path never saw this handle.
                Ok(handle) if inner.lifecycle.check_open().is_err() => {
                    let error = TxError::already_closed("transaction");
                    inner.begin_error = Some(error.clone());
                    (Err(error), Some(handle))
                }
                Ok(handle) => {
                    inner.handle = Some(handle.clone());
                    inner.lifecycle.started();
                    (Ok(handle), None)
                }
                Err(error) => {
                    inner.begin_error = Some(error.clone());
                    (Err(error), None)
                }
            };
            self.begin_done.notify_all();
            settled
        };

        if let Some(orphan) = orphan {
            return Err(match self.dispose(&orphan) {
                Ok(()) => TxError::already_closed("transaction"),
                Err(dispose_error) => {
                    TxError::already_closed("transaction").with_suppressed(dispose_error)
                }
            });
        }
        let handle = outcome?;

        event!(
            Level::DEBUG,
            local_id = %self.local_id,
            transaction_id = %handle,
            "transaction id obtained"
        );
        let info = self.info();
        self.listeners
            .notify(|l| l.transaction_id_obtained(&info, handle.id()));
        Ok(handle)
    }

    fn submit<T, F>(&self, sql: &str, params: &[Parameter], submit: F) -> Result<ResultHandle<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&dyn SqlService, &TransactionHandle) -> Result<PendingResponse<T>>,
    {
        self.inner.lock()?.lifecycle.check_active()?;
        let handle = self.handle()?;

        let execute_id = self.next_execute_id.fetch_add(1, Ordering::SeqCst);
        let info = self.info();
        self.listeners
            .notify(|l| l.execute_start(&info, execute_id, sql, params));

        let pending = match submit(self.service.as_ref(), &handle) {
            Ok(pending) => pending,
            Err(error) => {
                self.listeners
                    .notify(|l| l.execute_end(&info, execute_id, Some(&error)));
                return Err(error);
            }
        };

        let listeners = self.listeners.clone();
        let settle: SettleHook = Box::new(move |error| {
            listeners.notify(|l| l.execute_end(&info, execute_id, error));
        });
        let result = ResultHandle::new(pending, self.resolver.clone(), sql, Some(settle));
        match self.children.register(result.as_resource()) {
            Ok(tracked) => {
                result.attach(tracked);
                Ok(result)
            }
            Err(mut error) => {
                if let Err(close_error) = result.close() {
                    error.add_suppressed(close_error);
                }
                Err(error)
            }
        }
    }

    fn commit(&self, commit_type: CommitType) -> Result<()> {
        self.inner.lock()?.lifecycle.request_commit()?;

        let info = self.info();
        self.listeners.notify(|l| l.commit_start(&info, commit_type));
        let result = self
            .handle()
            .and_then(|handle| self.service.commit(&handle, commit_type))
            .and_then(|pending| self.resolver.resolve(pending, OperationKind::Commit));
        if result.is_ok() {
            self.lock().lifecycle.committed();
        }
        let info = self.info();
        self.listeners
            .notify(|l| l.commit_end(&info, commit_type, result.as_ref().err()));
        result
    }

    fn rollback(&self) -> Result<()> {
        self.inner.lock()?.lifecycle.request_rollback()?;

        let info = self.info();
        self.listeners.notify(|l| l.rollback_start(&info));
        let result = self
            .handle()
            .and_then(|handle| self.service.rollback(&handle))
            .and_then(|pending| self.resolver.resolve(pending, OperationKind::Rollback));
        if result.is_ok() {
            self.lock().lifecycle.rolled_back();
        }
        self.listeners
            .notify(|l| l.rollback_end(&info, result.as_ref().err()));
        result
    }

    /// Release the begin response or the server transaction, whichever is
    /// held.
    fn close_own(&self) -> Result<()> {
        let (begin, handle) = {
            let mut inner = self.lock();
            (inner.begin.take(), inner.handle.clone())
        };

        if let Some(begin) = begin {
            return self.resolver.close_pending(begin, OperationKind::Begin);
        }
        match handle {
            Some(handle) => self.dispose(&handle),
            None => Ok(()),
        }
    }

    fn dispose(&self, handle: &TransactionHandle) -> Result<()> {
        let pending = self.service.dispose_transaction(handle)?;
        self.resolver.resolve(pending, OperationKind::TransactionClose)
    }

    fn shutdown(&self) -> Result<()> {
        if !self.lock().lifecycle.begin_close() {
            return Ok(());
        }
        self.closing.raise();

        let result = self.children.close_all_with(|| self.close_own());
        self.lock().lifecycle.closed();
        if let Some(tracked) = self.tracked.get() {
            tracked.release();
        }

        event!(
            Level::DEBUG,
            local_id = %self.local_id,
            ok = result.is_ok(),
            "transaction closed"
        );
        let info = self.info();
        self.listeners
            .notify(|l| l.closed(&info, result.as_ref().err()));
        result
    }
}

impl ServerResource for TransactionCore {
    fn close(&self) -> Result<()> {
        self.shutdown()
    }

    fn describe(&self) -> String {
        format!("transaction {}", self.local_id)
    }
}

/// One server transaction.
///
/// All methods take `&self`; the transaction may be shared across threads.
/// Dropping an open transaction closes it, logging any failure.
pub struct Transaction {
    core: Arc<TransactionCore>,
}

impl Transaction {
    /// Submit the begin request. The server id is resolved lazily.
    pub(crate) fn begin(
        service: Arc<dyn SqlService>,
        resolver: AsyncResolver,
        option: TransactionOption,
        attempt: u32,
        listeners: Listeners<dyn TransactionListener>,
    ) -> Result<Self> {
        let pending = service.begin_transaction(&option)?;
        let local_id = LocalTransactionId::new();
        event!(
            Level::DEBUG,
            local_id = %local_id,
            option = %option,
            attempt,
            "transaction created"
        );

        Ok(Self {
            core: Arc::new(TransactionCore {
                local_id,
                attempt,
                option,
                created_at: Utc::now(),
                service,
                resolver,
                listeners,
                children: Arc::new(ResourceTracker::new(local_id.to_string())),
                inner: Mutex::new(Inner {
                    lifecycle: Lifecycle::new(),
                    begin: Some(pending),
                    begin_resolving: false,
                    begin_error: None,
                    handle: None,
                }),
                begin_done: Condvar::new(),
                closing: CloseSignal::new("transaction"),
                next_execute_id: AtomicU64::new(1),
                tracked: OnceLock::new(),
            }),
        })
    }

    pub(crate) fn as_resource(&self) -> Arc<dyn ServerResource> {
        Arc::clone(&self.core) as Arc<dyn ServerResource>
    }

    pub(crate) fn attach(&self, tracked: TrackedBy) {
        let _ = self.core.tracked.set(tracked);
    }

    pub fn local_id(&self) -> LocalTransactionId {
        self.core.local_id
    }

    pub fn attempt(&self) -> u32 {
        self.core.attempt
    }

    pub fn option(&self) -> &TransactionOption {
        &self.core.option
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.core.created_at
    }

    pub fn state(&self) -> TransactionState {
        self.core.lock().lifecycle.state()
    }

    pub fn info(&self) -> TransactionInfo {
        self.core.info()
    }

    /// Results executed through this transaction and not yet closed.
    pub fn open_results(&self) -> usize {
        self.core.children.len()
    }

    /// Server transaction id, waiting for the begin response if needed.
    ///
    /// # Errors
    /// The begin failure (cached: later calls return it again), or
    /// `AlreadyClosed`.
    pub fn transaction_id(&self) -> Result<String> {
        self.core.handle().map(|h| h.id().to_string())
    }

    /// Submit a statement; the returned handle resolves lazily.
    pub fn execute_statement(
        &self,
        sql: &str,
        params: &[Parameter],
    ) -> Result<ResultHandle<ExecuteOutcome>> {
        self.core
            .submit(sql, params, |service, tx| service.execute_statement(tx, sql, params))
    }

    pub fn execute_query(&self, sql: &str, params: &[Parameter]) -> Result<ResultHandle<RowStream>> {
        self.core
            .submit(sql, params, |service, tx| service.execute_query(tx, sql, params))
    }

    /// Execute, wait for the outcome, close the result.
    pub fn execute_and_get_count(&self, sql: &str, params: &[Parameter]) -> Result<Option<u64>> {
        self.execute_statement(sql, params)?
            .consume(|result| result.updated_count())
    }

    pub fn execute_and_get_rows(&self, sql: &str, params: &[Parameter]) -> Result<Vec<Row>> {
        self.execute_query(sql, params)?.consume(|result| result.rows())
    }

    pub fn execute_ddl(&self, sql: &str) -> Result<()> {
        self.execute_and_get_count(sql, &[]).map(|_| ())
    }

    /// Commit. Contacts the server at most once per transaction.
    ///
    /// # Errors
    /// - `AlreadyFinished` if commit or rollback was already requested
    /// - `AlreadyClosed` after close
    /// - the server failure or timeout otherwise
    pub fn commit(&self, commit_type: CommitType) -> Result<()> {
        self.core.commit(commit_type)
    }

    /// Roll back. Permitted once, including after a failed commit.
    pub fn rollback(&self) -> Result<()> {
        self.core.rollback()
    }

    /// Roll back unless the transaction already finished, never began, or
    /// already requested a rollback. Returns `None` when skipped.
    pub(crate) fn rollback_if_pending(&self) -> Option<Result<()>> {
        let skip = {
            let inner = self.core.lock();
            inner.lifecycle.check_open().is_err()
                || inner.lifecycle.state().is_finished()
                || inner.lifecycle.requested() == Some(Finish::Rollback)
                || inner.begin_error.is_some()
        };
        if skip { None } else { Some(self.rollback()) }
    }

    /// Server view of the transaction.
    pub fn status(&self) -> Result<TransactionStatus> {
        let handle = self.core.handle()?;
        let pending = self.core.service.transaction_status(&handle)?;
        self.core.resolver.resolve(pending, OperationKind::Status)
    }

    /// Explain a statement; the plan is passed through untouched.
    pub fn explain(&self, sql: &str, params: &[Parameter]) -> Result<StatementMetadata> {
        self.core.lock().lifecycle.check_open()?;
        let pending = self.core.service.explain(sql, params)?;
        self.core.resolver.resolve(pending, OperationKind::Explain)
    }

    /// Close every open result, then release the server transaction.
    /// Idempotent.
    ///
    /// # Errors
    /// The transaction's own close failure with result failures suppressed
    /// on it, or the aggregated result failures.
    pub fn close(&self) -> Result<()> {
        self.core.shutdown()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("local_id", &self.core.local_id)
            .field("attempt", &self.core.attempt)
            .field("option", &self.core.option)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(error) = self.core.shutdown() {
            event!(
                Level::WARN,
                local_id = %self.core.local_id,
                error = %error,
                "closing dropped transaction failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, ServerCode};
    use crate::service::{CloseReply, Reply, ScriptedService};
    use crate::session::options::{SessionOptions, TimeoutKey};
    use crate::session::resolver::{ExecutionRuntime, Interrupter};
    use std::time::Duration;

    fn begin(service: &Arc<ScriptedService>, options: SessionOptions) -> Transaction {
        let runtime = Arc::new(ExecutionRuntime::owned().unwrap());
        let resolver = AsyncResolver::new(runtime, options, Interrupter::new());
        Transaction::begin(
            Arc::clone(service) as Arc<dyn SqlService>,
            resolver,
            TransactionOption::occ(),
            1,
            Listeners::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_lazy_transaction_id() {
        let service = Arc::new(ScriptedService::new());
        let tx = begin(&service, SessionOptions::new());

        assert_eq!(tx.state(), TransactionState::Created);
        assert!(tx.info().transaction_id.is_none());

        let id = tx.transaction_id().unwrap();
        assert_eq!(tx.transaction_id().unwrap(), id);
        assert_eq!(tx.state(), TransactionState::Started);
        assert_eq!(service.closes(OperationKind::Begin), 1);
    }

    #[test]
    fn test_begin_failure_is_cached() {
        let service = Arc::new(ScriptedService::new());
        service.on_begin(Reply::err(TxError::server(
            ServerCode::connection_failure(),
            "unreachable",
        )));
        let tx = begin(&service, SessionOptions::new());

        let first = tx.transaction_id().unwrap_err();
        let second = tx.execute_ddl("CREATE TABLE t (id INT)").unwrap_err();
        assert_eq!(first.message(), second.message());
        assert_eq!(service.calls(OperationKind::Begin), 1);
        assert!(tx.rollback_if_pending().is_none());
    }

    #[test]
    fn test_double_commit_fails_locally() {
        let service = Arc::new(ScriptedService::new());
        let tx = begin(&service, SessionOptions::new());

        tx.commit(CommitType::Default).unwrap();
        let err = tx.commit(CommitType::Default).unwrap_err();

        assert_eq!(err.kind(), &ErrorKind::AlreadyFinished);
        assert_eq!(service.calls(OperationKind::Commit), 1);
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(tx.rollback().is_err());
    }

    #[test]
    fn test_commit_timeout_then_rollback() {
        let service = Arc::new(ScriptedService::new());
        service.on_commit(Reply::Never);
        let tx = begin(
            &service,
            SessionOptions::new().timeout(TimeoutKey::TransactionCommit, Duration::from_millis(50)),
        );

        let err = tx.commit(CommitType::Stored).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(service.closes(OperationKind::Commit), 1);

        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.rollback().is_err());
    }

    #[test]
    fn test_close_reclaims_results_and_disposes() {
        let service = Arc::new(ScriptedService::new());
        let tx = begin(&service, SessionOptions::new());

        let first = tx.execute_statement("UPDATE t SET v = 1", &[]).unwrap();
        let _second = tx.execute_query("SELECT * FROM t", &[]).unwrap();
        assert_eq!(tx.open_results(), 2);
        assert_eq!(first.updated_count().unwrap(), Some(1));

        tx.close().unwrap();
        tx.close().unwrap();
        assert_eq!(tx.open_results(), 0);
        assert_eq!(service.closes(OperationKind::TransactionClose), 1);
        assert_eq!(service.open_responses(), 0);
        assert_eq!(
            tx.execute_ddl("DROP TABLE t").unwrap_err().kind(),
            &ErrorKind::AlreadyClosed
        );
    }

    #[test]
    fn test_closed_result_deregisters() {
        let service = Arc::new(ScriptedService::new());
        let tx = begin(&service, SessionOptions::new());

        assert_eq!(tx.execute_and_get_count("DELETE FROM t", &[]).unwrap(), Some(1));
        assert_eq!(tx.open_results(), 0);
    }

    #[test]
    fn test_own_close_failure_is_primary() {
        let service = Arc::new(ScriptedService::new());
        service
            .on_close(OperationKind::Result, CloseReply::Fail(TxError::internal("r1")))
            .on_close(OperationKind::Result, CloseReply::Fail(TxError::internal("r2")))
            .on_dispose(Reply::err(TxError::internal("dispose")));
        let tx = begin(&service, SessionOptions::new());
        tx.execute_statement("UPDATE a SET v = 1", &[]).unwrap();
        tx.execute_statement("UPDATE b SET v = 1", &[]).unwrap();

        let err = tx.close().unwrap_err();
        assert_eq!(err.message(), "dispose");
        assert_eq!(err.suppressed().len(), 2);
    }

    #[test]
    fn test_drop_closes_open_begin() {
        let service = Arc::new(ScriptedService::new());
        {
            let _tx = begin(&service, SessionOptions::new());
        }
        assert_eq!(service.closes(OperationKind::Begin), 1);
        assert_eq!(service.calls(OperationKind::TransactionClose), 0);
    }

    #[test]
    fn test_close_ends_pending_begin() {
        let service = Arc::new(ScriptedService::new());
        service.on_begin(Reply::Never);
        let tx = Arc::new(begin(&service, SessionOptions::new()));

        let waiter = {
            let tx = Arc::clone(&tx);
            std::thread::spawn(move || tx.transaction_id())
        };
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tx.state(), TransactionState::Created);
        tx.close().unwrap();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AlreadyClosed);
        assert_eq!(service.closes(OperationKind::Begin), 1);
        assert_eq!(service.calls(OperationKind::TransactionClose), 0);
        assert_eq!(tx.transaction_id().unwrap_err().kind(), &ErrorKind::AlreadyClosed);
    }
}
