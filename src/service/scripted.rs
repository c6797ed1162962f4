//! Programmable in-memory `SqlService`.
//!
//! Each operation answers from a queue of scripted replies, falling back to
//! a sticky reply (if set) and then to a successful default. Every submitted
//! request and every response close is counted so tests can assert on
//! exactly what reached the "server".

use super::{
    ExecuteOutcome, FutureResponse, PendingResponse, SqlService, StatementMetadata, SystemInfo,
    TransactionHandle, TransactionStatus,
};
use crate::core::{CommitType, OperationKind, Parameter, Result, TransactionOption, TxError};
use crate::result::RowStream;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted response completes.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ready(Result<T>),
    Delayed(Duration, Result<T>),
    /// Never completes; only a timeout or interrupt ends the wait
    Never,
}

impl<T> Reply<T> {
    pub fn ok(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn err(error: TxError) -> Self {
        Self::Ready(Err(error))
    }
}

/// How closing a scripted response behaves.
#[derive(Debug, Clone)]
pub enum CloseReply {
    Ok,
    Fail(TxError),
    Hang,
}

struct Channel<T> {
    queued: VecDeque<Reply<T>>,
    sticky: Option<Reply<T>>,
}

impl<T: Clone> Channel<T> {
    fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            sticky: None,
        }
    }

    fn next(&mut self, default: impl FnOnce() -> Reply<T>) -> Reply<T> {
        if let Some(reply) = self.queued.pop_front() {
            return reply;
        }
        match &self.sticky {
            Some(reply) => reply.clone(),
            None => default(),
        }
    }
}

struct Script {
    begin: Channel<TransactionHandle>,
    execute: Channel<ExecuteOutcome>,
    query: Channel<RowStream>,
    commit: Channel<()>,
    rollback: Channel<()>,
    status: Channel<TransactionStatus>,
    explain: Channel<StatementMetadata>,
    dispose: Channel<()>,
    close: HashMap<OperationKind, VecDeque<CloseReply>>,
}

#[derive(Default)]
struct Stats {
    calls: HashMap<OperationKind, usize>,
    closes: HashMap<OperationKind, usize>,
    statements: Vec<String>,
    commit_types: Vec<CommitType>,
    begin_options: Vec<TransactionOption>,
}

/// In-memory service driven by a script of replies.
pub struct ScriptedService {
    script: Mutex<Script>,
    stats: Arc<Mutex<Stats>>,
}

impl Default for ScriptedService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                begin: Channel::new(),
                execute: Channel::new(),
                query: Channel::new(),
                commit: Channel::new(),
                rollback: Channel::new(),
                status: Channel::new(),
                explain: Channel::new(),
                dispose: Channel::new(),
                close: HashMap::new(),
            }),
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    fn with_script(&self, f: impl FnOnce(&mut Script)) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script);
    }

    pub fn on_begin(&self, reply: Reply<TransactionHandle>) -> &Self {
        self.with_script(|s| s.begin.queued.push_back(reply));
        self
    }

    pub fn on_execute(&self, reply: Reply<ExecuteOutcome>) -> &Self {
        self.with_script(|s| s.execute.queued.push_back(reply));
        self
    }

    pub fn on_query(&self, reply: Reply<RowStream>) -> &Self {
        self.with_script(|s| s.query.queued.push_back(reply));
        self
    }

    pub fn on_commit(&self, reply: Reply<()>) -> &Self {
        self.with_script(|s| s.commit.queued.push_back(reply));
        self
    }

    /// Every commit without a queued reply answers with `reply`.
    pub fn always_commit(&self, reply: Reply<()>) -> &Self {
        self.with_script(|s| s.commit.sticky = Some(reply));
        self
    }

    pub fn on_rollback(&self, reply: Reply<()>) -> &Self {
        self.with_script(|s| s.rollback.queued.push_back(reply));
        self
    }

    pub fn on_status(&self, reply: Reply<TransactionStatus>) -> &Self {
        self.with_script(|s| s.status.queued.push_back(reply));
        self
    }

    pub fn on_explain(&self, reply: Reply<StatementMetadata>) -> &Self {
        self.with_script(|s| s.explain.queued.push_back(reply));
        self
    }

    pub fn on_dispose(&self, reply: Reply<()>) -> &Self {
        self.with_script(|s| s.dispose.queued.push_back(reply));
        self
    }

    /// Behaviour of the next close of a response of the given operation.
    pub fn on_close(&self, operation: OperationKind, reply: CloseReply) -> &Self {
        self.with_script(|s| s.close.entry(operation).or_default().push_back(reply));
        self
    }

    fn read_stats<R>(&self, f: impl FnOnce(&Stats) -> R) -> R {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&stats)
    }

    /// Requests submitted for `operation`.
    pub fn calls(&self, operation: OperationKind) -> usize {
        self.read_stats(|s| s.calls.get(&operation).copied().unwrap_or(0))
    }

    /// Response closes observed for `operation`.
    pub fn closes(&self, operation: OperationKind) -> usize {
        self.read_stats(|s| s.closes.get(&operation).copied().unwrap_or(0))
    }

    /// Responses submitted but never closed, across all operations.
    pub fn open_responses(&self) -> usize {
        self.read_stats(|s| {
            let calls: usize = s.calls.values().sum();
            let closes: usize = s.closes.values().sum();
            calls.saturating_sub(closes)
        })
    }

    pub fn statements(&self) -> Vec<String> {
        self.read_stats(|s| s.statements.clone())
    }

    pub fn commit_types(&self) -> Vec<CommitType> {
        self.read_stats(|s| s.commit_types.clone())
    }

    pub fn begin_options(&self) -> Vec<TransactionOption> {
        self.read_stats(|s| s.begin_options.clone())
    }

    fn respond<T>(&self, operation: OperationKind, reply: Reply<T>) -> PendingResponse<T>
    where
        T: Send + 'static,
    {
        let close = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script
                .close
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
                .unwrap_or(CloseReply::Ok)
        };
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            *stats.calls.entry(operation).or_insert(0) += 1;
        }
        Box::new(ScriptedResponse {
            reply: Some(reply),
            close,
            operation,
            stats: Arc::clone(&self.stats),
        })
    }

    fn next<T: Clone>(
        &self,
        pick: impl FnOnce(&mut Script) -> &mut Channel<T>,
        default: impl FnOnce() -> Reply<T>,
    ) -> Reply<T> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        pick(&mut script).next(default)
    }

    fn record(&self, f: impl FnOnce(&mut Stats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

impl SqlService for ScriptedService {
    fn begin_transaction(
        &self,
        option: &TransactionOption,
    ) -> Result<PendingResponse<TransactionHandle>> {
        self.record(|s| s.begin_options.push(option.clone()));
        let reply = self.next(
            |s| &mut s.begin,
            || Reply::ok(TransactionHandle::new(uuid::Uuid::new_v4().to_string())),
        );
        Ok(self.respond(OperationKind::Begin, reply))
    }

    fn execute_statement(
        &self,
        _tx: &TransactionHandle,
        sql: &str,
        _params: &[Parameter],
    ) -> Result<PendingResponse<ExecuteOutcome>> {
        self.record(|s| s.statements.push(sql.to_string()));
        let reply = self.next(
            |s| &mut s.execute,
            || {
                Reply::ok(
                    ExecuteOutcome::new().with_counter(super::CounterType::UpdatedRows, 1),
                )
            },
        );
        Ok(self.respond(OperationKind::Result, reply))
    }

    fn execute_query(
        &self,
        _tx: &TransactionHandle,
        sql: &str,
        _params: &[Parameter],
    ) -> Result<PendingResponse<RowStream>> {
        self.record(|s| s.statements.push(sql.to_string()));
        let reply = self.next(|s| &mut s.query, || Reply::ok(RowStream::empty()));
        Ok(self.respond(OperationKind::Result, reply))
    }

    fn commit(
        &self,
        _tx: &TransactionHandle,
        commit_type: CommitType,
    ) -> Result<PendingResponse<()>> {
        self.record(|s| s.commit_types.push(commit_type));
        let reply = self.next(|s| &mut s.commit, || Reply::ok(()));
        Ok(self.respond(OperationKind::Commit, reply))
    }

    fn rollback(&self, _tx: &TransactionHandle) -> Result<PendingResponse<()>> {
        let reply = self.next(|s| &mut s.rollback, || Reply::ok(()));
        Ok(self.respond(OperationKind::Rollback, reply))
    }

    fn transaction_status(
        &self,
        _tx: &TransactionHandle,
    ) -> Result<PendingResponse<TransactionStatus>> {
        let reply = self.next(|s| &mut s.status, || Reply::ok(TransactionStatus::running()));
        Ok(self.respond(OperationKind::Status, reply))
    }

    fn explain(
        &self,
        sql: &str,
        _params: &[Parameter],
    ) -> Result<PendingResponse<StatementMetadata>> {
        let sql = sql.to_string();
        let reply = self.next(
            |s| &mut s.explain,
            move || {
                Reply::ok(StatementMetadata {
                    format_id: "scripted".to_string(),
                    format_version: 1,
                    contents: sql,
                    columns: Vec::new(),
                })
            },
        );
        Ok(self.respond(OperationKind::Explain, reply))
    }

    fn system_info(&self) -> Result<PendingResponse<SystemInfo>> {
        let reply = Reply::ok(SystemInfo {
            name: "scripted".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        Ok(self.respond(OperationKind::SystemInfo, reply))
    }

    fn dispose_transaction(&self, _tx: &TransactionHandle) -> Result<PendingResponse<()>> {
        let reply = self.next(|s| &mut s.dispose, || Reply::ok(()));
        Ok(self.respond(OperationKind::TransactionClose, reply))
    }
}

struct ScriptedResponse<T> {
    reply: Option<Reply<T>>,
    close: CloseReply,
    operation: OperationKind,
    stats: Arc<Mutex<Stats>>,
}

#[async_trait]
impl<T: Send + 'static> FutureResponse<T> for ScriptedResponse<T> {
    async fn get(&mut self) -> Result<T> {
        let wait = match &self.reply {
            Some(Reply::Never) => Wait::Forever,
            Some(Reply::Delayed(delay, _)) => Wait::For(*delay),
            Some(Reply::Ready(_)) => Wait::Now,
            None => {
                return Err(TxError::internal(format!(
                    "{} response already consumed",
                    self.operation
                )));
            }
        };
        match wait {
            Wait::Forever => std::future::pending::<()>().await,
            Wait::For(delay) => tokio::time::sleep(delay).await,
            Wait::Now => {}
        }
        match self.reply.take() {
            Some(Reply::Ready(result)) | Some(Reply::Delayed(_, result)) => result,
            _ => Err(TxError::internal("scripted reply vanished")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            *stats.closes.entry(self.operation).or_insert(0) += 1;
        }
        match self.close.clone() {
            CloseReply::Ok => Ok(()),
            CloseReply::Fail(error) => Err(error),
            CloseReply::Hang => std::future::pending().await,
        }
    }
}

enum Wait {
    Forever,
    For(Duration),
    Now,
}
