// ============================================================================
// Async Resolver
// ============================================================================
//
// Blocks the calling thread on one pending response, bounded by the
// operation's connect timeout. Whatever happens (success, server error,
// timeout, interrupt, owner closed) the response is closed exactly once,
// under the operation's close timeout.
//
// ============================================================================

use super::options::{SessionOptions, TimeoutKey};
use crate::core::{OperationKind, Result, TimeoutPhase, TxError};
use crate::service::{FutureResponse, PendingResponse};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::{Notify, watch};
use tracing::{Level, event};

/// Runtime that drives pending responses: owned by the session, or borrowed
/// from the application.
pub enum ExecutionRuntime {
    Owned(Runtime),
    Borrowed(Handle),
}

impl ExecutionRuntime {
    /// Build a small dedicated multi-thread runtime (timers and I/O enabled).
    pub fn owned() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("txexec-io")
            .enable_all()
            .build()
            .map_err(|e| TxError::config(format!("failed to start runtime: {}", e)))?;
        Ok(Self::Owned(runtime))
    }

    pub fn handle(&self) -> &Handle {
        match self {
            Self::Owned(runtime) => runtime.handle(),
            Self::Borrowed(handle) => handle,
        }
    }
}

#[derive(Debug, Default)]
struct InterruptState {
    pending: AtomicBool,
    notify: Notify,
}

/// Wakes every resolution currently blocked on the session.
///
/// An interrupt raised while nothing is waiting stays pending and fails the
/// next wait instead. The wait that observes an interrupt consumes it.
/// Interruption is reported as a failure; the interrupted response is still
/// closed.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        event!(Level::DEBUG, "interrupting pending resolutions");
        self.state.pending.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Whether an interrupt is raised and not yet consumed by a wait.
    pub fn is_pending(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.state.pending.swap(false, Ordering::SeqCst)
    }
}

/// Raised once when the owner of in-flight waits closes. Never reset.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    owner: &'static str,
    raised: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new(owner: &'static str) -> Self {
        let (raised, _) = watch::channel(false);
        Self { owner, raised }
    }

    pub(crate) fn raise(&self) {
        self.raised.send_replace(true);
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.raised.subscribe()
    }
}

async fn raised(signal: Option<watch::Receiver<bool>>) {
    if let Some(mut signal) = signal {
        if signal.wait_for(|raised| *raised).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

enum Waited<T> {
    Done(Result<T>),
    TimedOut,
    Interrupted,
    Cancelled,
}

async fn bounded<F: Future>(future: F, limit: Option<Duration>) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

/// Timeout-bounded resolution of pending responses.
#[derive(Clone)]
pub struct AsyncResolver {
    runtime: Arc<ExecutionRuntime>,
    options: SessionOptions,
    interrupter: Interrupter,
}

impl AsyncResolver {
    pub fn new(
        runtime: Arc<ExecutionRuntime>,
        options: SessionOptions,
        interrupter: Interrupter,
    ) -> Self {
        Self {
            runtime,
            options,
            interrupter,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    /// Drive a future to completion from synchronous code.
    ///
    /// # Errors
    /// `Config` when called from inside a current-thread tokio runtime, which
    /// cannot be blocked on; the future is dropped without being polled.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let handle = self.runtime.handle();
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(TxError::config(
                    "cannot block inside a current-thread runtime; \
                     call from a multi-thread runtime or from outside any runtime",
                ))
            }
            Ok(_) => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
            Err(_) => Ok(handle.block_on(future)),
        }
    }

    /// Wait for `pending`, then close it.
    ///
    /// # Errors
    /// - `Timeout { phase: Connect }` when the outcome did not arrive in time
    /// - `Timeout { phase: Close }` when, after that, closing also timed out
    /// - `Interrupted` when `Interrupter::interrupt` fired before or during
    ///   the wait
    /// - the service's own error, with any close failure suppressed on it
    /// - `Config` from [`AsyncResolver::block_on`]
    pub fn resolve<T: Send>(
        &self,
        pending: PendingResponse<T>,
        operation: OperationKind,
    ) -> Result<T> {
        self.resolve_with(pending, operation, None)
    }

    /// Like `resolve`, but the wait also ends with `AlreadyClosed` once
    /// `signal` is raised.
    pub(crate) fn resolve_or_close<T: Send>(
        &self,
        pending: PendingResponse<T>,
        operation: OperationKind,
        signal: &CloseSignal,
    ) -> Result<T> {
        self.resolve_with(pending, operation, Some(signal))
    }

    fn resolve_with<T: Send>(
        &self,
        mut pending: PendingResponse<T>,
        operation: OperationKind,
        signal: Option<&CloseSignal>,
    ) -> Result<T> {
        let connect_limit = self.options.policy(TimeoutKey::connect(operation)).duration();
        let close_limit = self.options.policy(TimeoutKey::close(operation)).duration();
        let watched = signal.map(CloseSignal::watch);

        self.block_on(async {
            let waited = self.wait(pending.as_mut(), connect_limit, watched).await;
            let closed = close_bounded(pending.as_mut(), close_limit, operation).await;

            match waited {
                Waited::Done(Ok(value)) => closed.map(|_| value),
                Waited::Done(Err(error)) => Err(suppress(error, closed)),
                Waited::TimedOut => {
                    event!(
                        Level::DEBUG,
                        operation = %operation,
                        limit = ?connect_limit,
                        "pending response timed out"
                    );
                    match closed {
                        Err(close_error) if close_error.is_timeout() => Err(close_error),
                        closed => Err(suppress(
                            TxError::timeout(operation, TimeoutPhase::Connect),
                            closed,
                        )),
                    }
                }
                Waited::Interrupted => Err(suppress(TxError::interrupted(operation), closed)),
                Waited::Cancelled => {
                    let owner = signal.map_or("resource", |s| s.owner);
                    Err(suppress(TxError::already_closed(owner), closed))
                }
            }
        })?
    }

    /// Close a response that will never be waited for.
    pub fn close_pending<T: Send>(
        &self,
        mut pending: PendingResponse<T>,
        operation: OperationKind,
    ) -> Result<()> {
        let close_limit = self.options.policy(TimeoutKey::close(operation)).duration();
        self.block_on(close_bounded(pending.as_mut(), close_limit, operation))?
    }

    async fn wait<T: Send>(
        &self,
        pending: &mut dyn FutureResponse<T>,
        limit: Option<Duration>,
        signal: Option<watch::Receiver<bool>>,
    ) -> Waited<T> {
        // Registered before the flag check so an interrupt in between is not lost.
        let interrupted = self.interrupter.state.notify.notified();
        tokio::pin!(interrupted);
        if self.interrupter.take() {
            return Waited::Interrupted;
        }

        tokio::select! {
            outcome = bounded(pending.get(), limit) => match outcome {
                Some(result) => Waited::Done(result),
                None => Waited::TimedOut,
            },
            _ = &mut interrupted => {
                self.interrupter.take();
                Waited::Interrupted
            }
            _ = raised(signal) => Waited::Cancelled,
        }
    }
}

async fn close_bounded<T: Send>(
    pending: &mut dyn FutureResponse<T>,
    limit: Option<Duration>,
    operation: OperationKind,
) -> Result<()> {
    match bounded(pending.close(), limit).await {
        Some(result) => result,
        None => {
            event!(Level::WARN, operation = %operation, "closing pending response timed out");
            Err(TxError::timeout(operation, TimeoutPhase::Close))
        }
    }
}

fn suppress(mut primary: TxError, closed: Result<()>) -> TxError {
    if let Err(close_error) = closed {
        primary.add_suppressed(close_error);
    }
    primary
}
