// ============================================================================
// Transaction Manager
// ============================================================================
//
// Runs a user action inside a transaction, committing on success and
// retrying on retryable aborts. Attempts are strictly sequential; each one
// gets a fresh transaction that is closed before the next attempt starts.
//
// ============================================================================

use super::listener::{Listeners, ManagerListener, TransactionInfo, TransactionListener};
use super::policy::{GiveUp, ManagerSettings, RetryDecision, TransactionOptionSupplier};
use super::state::TransactionState;
use super::transaction::Transaction;
use crate::core::{
    AttemptContext, DefaultDiagnosticCodeProvider, DiagnosticCodeProvider, Parameter, Result, Row,
    TransactionOption, TxError,
};
use crate::session::Session;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event, info_span};

/// Global managed-execution counter
static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

/// Forwards the attempt's id resolution to manager listeners.
struct StartedBridge {
    execution_id: u64,
    listeners: Listeners<dyn ManagerListener>,
}

impl TransactionListener for StartedBridge {
    fn transaction_id_obtained(&self, tx: &TransactionInfo, _transaction_id: &str) {
        self.listeners
            .notify(|l| l.transaction_started(self.execution_id, tx));
    }
}

pub struct TransactionManager {
    session: Session,
    supplier: Arc<dyn TransactionOptionSupplier>,
    settings: ManagerSettings,
    listeners: Listeners<dyn ManagerListener>,
    diagnostics: Arc<dyn DiagnosticCodeProvider>,
}

impl TransactionManager {
    pub fn new(session: Session, supplier: impl TransactionOptionSupplier + 'static) -> Self {
        Self {
            session,
            supplier: Arc::new(supplier),
            settings: ManagerSettings::default(),
            listeners: Listeners::new(),
            diagnostics: Arc::new(DefaultDiagnosticCodeProvider),
        }
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ManagerListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn with_diagnostic_provider(mut self, provider: Arc<dyn DiagnosticCodeProvider>) -> Self {
        self.diagnostics = provider;
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run `action` in a transaction and commit, retrying per the supplier.
    ///
    /// If the action finishes the transaction itself (commit or rollback),
    /// the manager does not commit again.
    ///
    /// # Errors
    /// - the abort cause, with attempt context, when it is not retryable
    /// - `RetryOver` wrapping the last cause once the attempt budget is spent
    ///
    /// A failed defensive rollback or close, of this attempt or of any
    /// earlier retried attempt, is attached as suppressed; it never replaces
    /// the cause. After a successful attempt those earlier failures are
    /// only logged.
    pub fn execute<R, F>(&self, mut action: F) -> Result<R>
    where
        F: FnMut(&Transaction) -> Result<R>,
    {
        let execution_id = NEXT_EXECUTION_ID.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("tm_execute", execution_id);
        let _enter = span.enter();

        self.listeners.notify(|l| l.execute_start(execution_id));

        let mut option = self.labeled(self.supplier.initial_option());
        let mut attempt = 1u32;
        // Rollback and close failures of attempts that were retried
        let mut cleanup: Vec<TxError> = Vec::new();
        loop {
            self.listeners
                .notify(|l| l.transaction_start(execution_id, attempt, &option));

            let tx = match self.begin_attempt(execution_id, &option, attempt) {
                Ok(tx) => tx,
                Err(error) => {
                    let error = with_suppressed_all(
                        error.with_context(AttemptContext {
                            transaction_id: None,
                            attempt,
                            option: option.clone(),
                            next_option: None,
                        }),
                        cleanup,
                    );
                    self.listeners
                        .notify(|l| l.execute_end_fail(execution_id, None, &error));
                    return Err(error);
                }
            };

            let cause = match self.run_attempt(&tx, &mut action) {
                Ok((value, committed)) => {
                    let info = tx.info();
                    if let Err(error) = tx.close() {
                        let error =
                            with_suppressed_all(error.with_context(context(&info, None)), cleanup);
                        self.listeners
                            .notify(|l| l.execute_end_fail(execution_id, Some(&info), &error));
                        return Err(error);
                    }
                    self.listeners
                        .notify(|l| l.execute_end_success(execution_id, &info, committed));
                    return Ok(value);
                }
                Err(cause) => cause,
            };

            let info = tx.info();
            self.listeners
                .notify(|l| l.transaction_exception(execution_id, &info, &cause));

            let rollback_error = match tx.rollback_if_pending() {
                Some(Ok(())) => {
                    self.listeners
                        .notify(|l| l.transaction_rollbacked(execution_id, &info, None));
                    None
                }
                Some(Err(error)) => {
                    event!(Level::WARN, attempt, error = %error, "rollback after abort failed");
                    self.listeners
                        .notify(|l| l.transaction_rollbacked(execution_id, &info, Some(&error)));
                    Some(error)
                }
                None => None,
            };

            let code = self.diagnostics.find(&cause);
            let decision = self.supplier.decide(attempt, &cause, &code);
            event!(Level::DEBUG, attempt, code = %code, decision = ?decision, "attempt aborted");

            match decision {
                RetryDecision::Retry(next) => {
                    let next = self.labeled(next);
                    self.listeners
                        .notify(|l| l.transaction_retry(execution_id, &info, &cause, &next));
                    cleanup.extend(rollback_error);
                    if let Err(error) = tx.close() {
                        event!(Level::WARN, attempt, error = %error, "closing aborted attempt failed");
                        cleanup.push(error);
                    }
                    drop(tx);

                    let delay = self.settings.backoff.delay(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    option = next;
                    attempt += 1;
                }
                RetryDecision::GiveUp(give_up) => {
                    let mut error = match give_up {
                        GiveUp::RetryOver { next_option } => {
                            self.listeners
                                .notify(|l| l.transaction_retry_over(execution_id, &info, &cause));
                            let next_option = next_option.map(|o| self.labeled(o));
                            TxError::retry_over(cause, context(&info, next_option))
                        }
                        GiveUp::NotRetryable => cause.with_context(context(&info, None)),
                    };
                    for earlier in cleanup {
                        error.add_suppressed(earlier);
                    }
                    if let Some(rollback_error) = rollback_error {
                        error.add_suppressed(rollback_error);
                    }
                    if let Err(close_error) = tx.close() {
                        error.add_suppressed(close_error);
                    }
                    self.listeners
                        .notify(|l| l.execute_end_fail(execution_id, Some(&info), &error));
                    return Err(error);
                }
            }
        }
    }

    /// Execute one DDL statement in a managed transaction.
    pub fn execute_ddl(&self, sql: &str) -> Result<()> {
        self.execute(|tx| tx.execute_ddl(sql))
    }

    pub fn execute_and_get_count(&self, sql: &str, params: &[Parameter]) -> Result<Option<u64>> {
        self.execute(|tx| tx.execute_and_get_count(sql, params))
    }

    pub fn execute_and_get_rows(&self, sql: &str, params: &[Parameter]) -> Result<Vec<Row>> {
        self.execute(|tx| tx.execute_and_get_rows(sql, params))
    }

    fn begin_attempt(
        &self,
        execution_id: u64,
        option: &TransactionOption,
        attempt: u32,
    ) -> Result<Transaction> {
        let mut listeners: Listeners<dyn TransactionListener> = Listeners::new();
        listeners.add(Arc::new(StartedBridge {
            execution_id,
            listeners: self.listeners.clone(),
        }));
        self.session.begin_attempt(option.clone(), attempt, &listeners)
    }

    /// Returns the value and whether the transaction ended committed.
    fn run_attempt<R, F>(&self, tx: &Transaction, action: &mut F) -> Result<(R, bool)>
    where
        F: FnMut(&Transaction) -> Result<R>,
    {
        let value = action(tx)?;
        match tx.state() {
            TransactionState::Committed => Ok((value, true)),
            TransactionState::RolledBack => Ok((value, false)),
            _ => {
                tx.commit(self.settings.commit_type)?;
                Ok((value, true))
            }
        }
    }

    fn labeled(&self, option: TransactionOption) -> TransactionOption {
        match (&self.settings.label, option.label()) {
            (Some(label), None) => option.with_label(label.clone()),
            _ => option,
        }
    }
}

fn with_suppressed_all(mut error: TxError, suppressed: Vec<TxError>) -> TxError {
    for other in suppressed {
        error.add_suppressed(other);
    }
    error
}

fn context(info: &TransactionInfo, next_option: Option<TransactionOption>) -> AttemptContext {
    AttemptContext {
        transaction_id: info.transaction_id.clone(),
        attempt: info.attempt,
        option: info.option.clone(),
        next_option,
    }
}
