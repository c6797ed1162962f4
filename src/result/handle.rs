// ============================================================================
// Result Handle
// ============================================================================
//
// Wraps the pending response of one executed statement. The outcome is
// resolved lazily on first access and cached; the handle stays registered
// with its transaction until closed, so closing the transaction reclaims
// results the caller never looked at.
//
// ============================================================================

use crate::core::{OperationKind, Result, Row, TxError};
use crate::service::{ExecuteOutcome, PendingResponse};
use crate::session::resolver::{AsyncResolver, CloseSignal};
use crate::session::tracker::{ServerResource, TrackedBy};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use super::RowStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Pending,
    Succeeded,
    Failed,
    Closed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Invoked exactly once, when the outcome is first known or the handle is
/// closed without ever being resolved.
pub(crate) type SettleHook = Box<dyn FnOnce(Option<&TxError>) + Send>;

struct Slot<T> {
    pending: Option<PendingResponse<T>>,
    outcome: Option<Result<T>>,
    /// Set while one caller waits on the response outside the lock
    resolving: bool,
    closed: bool,
}

struct ResultCell<T> {
    sql: String,
    slot: Mutex<Slot<T>>,
    settled: Condvar,
    closing: CloseSignal,
    resolver: AsyncResolver,
    settle: Mutex<Option<SettleHook>>,
    tracked: OnceLock<TrackedBy>,
}

impl<T: Send + 'static> ResultCell<T> {
    fn settle(&self, error: Option<&TxError>) {
        let hook = self.settle.lock().map(|mut h| h.take()).unwrap_or(None);
        if let Some(hook) = hook {
            hook(error);
        }
    }

    fn close_response(&self) -> Result<()> {
        let (pending, resolved) = {
            let mut slot = self.slot.lock()?;
            if slot.closed {
                return Ok(());
            }
            slot.closed = true;
            (slot.pending.take(), slot.outcome.is_some())
        };
        self.closing.raise();

        if let Some(tracked) = self.tracked.get() {
            tracked.release();
        }

        let closed = match pending {
            Some(pending) => self.resolver.close_pending(pending, OperationKind::Result),
            None => Ok(()),
        };
        if !resolved {
            let closed_early = TxError::already_closed("result");
            self.settle(Some(closed.as_ref().err().unwrap_or(&closed_early)));
        }
        closed
    }
}

impl<T: Send + 'static> ServerResource for ResultCell<T> {
    fn close(&self) -> Result<()> {
        self.close_response()
    }

    fn describe(&self) -> String {
        format!("result of `{}`", self.sql)
    }
}

/// Lazily resolved outcome of one statement.
pub struct ResultHandle<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T: Clone + Send + 'static> ResultHandle<T> {
    pub(crate) fn new(
        pending: PendingResponse<T>,
        resolver: AsyncResolver,
        sql: &str,
        settle: Option<SettleHook>,
    ) -> Self {
        Self {
            cell: Arc::new(ResultCell {
                sql: sql.to_string(),
                slot: Mutex::new(Slot {
                    pending: Some(pending),
                    outcome: None,
                    resolving: false,
                    closed: false,
                }),
                settled: Condvar::new(),
                closing: CloseSignal::new("result"),
                resolver,
                settle: Mutex::new(settle),
                tracked: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn as_resource(&self) -> Arc<dyn ServerResource> {
        Arc::clone(&self.cell) as Arc<dyn ServerResource>
    }

    pub(crate) fn attach(&self, tracked: TrackedBy) {
        let _ = self.cell.tracked.set(tracked);
    }

    pub fn sql(&self) -> &str {
        &self.cell.sql
    }

    /// Wait for the outcome (first call only) and return it.
    ///
    /// A failed outcome is cached too: later calls return the same error
    /// without contacting the service again.
    ///
    /// The wait runs without the lock held, so `close` from another thread
    /// ends it; concurrent callers block until it settles.
    pub fn get(&self) -> Result<T> {
        let pending = {
            let mut slot = self.cell.slot.lock()?;
            loop {
                if slot.closed {
                    return Err(TxError::already_closed("result"));
                }
                if let Some(outcome) = &slot.outcome {
                    return outcome.clone();
                }
                if !slot.resolving {
                    break;
                }
                slot = self
                    .cell
                    .settled
                    .wait(slot)
                    .unwrap_or_else(|e| e.into_inner());
            }
            let pending = slot
                .pending
                .take()
                .ok_or_else(|| TxError::internal("result has neither outcome nor response"))?;
            slot.resolving = true;
            pending
        };

        let resolved =
            self.cell
                .resolver
                .resolve_or_close(pending, OperationKind::Result, &self.cell.closing);
        {
            let mut slot = self.cell.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.resolving = false;
            if !slot.closed {
                slot.outcome = Some(resolved.clone());
            }
            self.cell.settled.notify_all();
        }

        self.cell.settle(resolved.as_ref().err());
        resolved
    }

    pub fn status(&self) -> ResultStatus {
        match self.cell.slot.lock() {
            Ok(slot) if slot.closed => ResultStatus::Closed,
            Ok(slot) => match &slot.outcome {
                None => ResultStatus::Pending,
                Some(Ok(_)) => ResultStatus::Succeeded,
                Some(Err(_)) => ResultStatus::Failed,
            },
            Err(_) => ResultStatus::Failed,
        }
    }

    /// `None` while unresolved.
    pub fn is_ok(&self) -> Option<bool> {
        match self.status() {
            ResultStatus::Succeeded => Some(true),
            ResultStatus::Failed => Some(false),
            ResultStatus::Pending | ResultStatus::Closed => None,
        }
    }

    /// Release the response and deregister from the owning transaction.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.cell.close_response()
    }

    /// Run `f` on the outcome, then close the handle.
    ///
    /// A failure of `f` wins; a close failure is then suppressed on it.
    pub(crate) fn consume<R>(self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let value = f(&self);
        let closed = self.close();
        match (value, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_error)) => Err(close_error),
            (Err(mut error), Err(close_error)) => {
                error.add_suppressed(close_error);
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
        }
    }
}

impl ResultHandle<ExecuteOutcome> {
    /// Rows touched by the statement; `None` if the service reported no
    /// counter.
    pub fn updated_count(&self) -> Result<Option<u64>> {
        Ok(self.get()?.updated_count())
    }
}

impl ResultHandle<RowStream> {
    pub fn rows(&self) -> Result<Vec<Row>> {
        Ok(self.get()?.into_rows())
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle").field("sql", &self.cell.sql).finish()
    }
}
