/// Transaction tests
///
/// Lifecycle, result tracking and close hierarchy of transactions created
/// directly on a session.
/// Run with: cargo test --test transaction_tests
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use txexec::core::{CommitType, ErrorKind, OperationKind, Parameter, ServerCode, TransactionOption, TxError, Value};
use txexec::result::{ResultStatus, RowStream};
use txexec::service::{CloseReply, Reply, ScriptedService, SqlService, TransactionStatus};
use txexec::session::Session;
use txexec::transaction::{TransactionInfo, TransactionListener, TransactionState};

fn session(service: &Arc<ScriptedService>) -> Session {
    Session::connect(Arc::clone(service) as Arc<dyn SqlService>).unwrap()
}

#[test]
fn test_transaction_execute_commit() {
    let service = Arc::new(ScriptedService::new());
    let session = session(&service);

    let tx = session.create_transaction(TransactionOption::occ()).unwrap();
    let count = tx
        .execute_and_get_count(
            "INSERT INTO users VALUES (:id, :name)",
            &[Parameter::new("id", 1), Parameter::new("name", "alice")],
        )
        .unwrap();
    assert_eq!(count, Some(1));

    tx.commit(CommitType::Stored).unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    tx.close().unwrap();

    assert_eq!(service.statements(), vec!["INSERT INTO users VALUES (:id, :name)"]);
    assert_eq!(service.commit_types(), vec![CommitType::Stored]);
    assert_eq!(service.open_responses(), 0);
}

#[test]
fn test_query_rows() {
    let service = Arc::new(ScriptedService::new());
    service.on_query(Reply::ok(RowStream::new(
        vec!["id".into(), "name".into()],
        vec![
            vec![Value::Integer(1), Value::from("alice")],
            vec![Value::Integer(2), Value::from("bob")],
        ],
    )));
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::rtx()).unwrap();

    let rows = tx.execute_and_get_rows("SELECT id, name FROM users", &[]).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1][1], Value::from("bob"));
    assert_eq!(tx.open_results(), 0);
}

#[test]
fn test_commit_twice_contacts_server_once() {
    let service = Arc::new(ScriptedService::new());
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::occ()).unwrap();

    tx.commit(CommitType::Default).unwrap();
    let err = tx.commit(CommitType::Default).unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::AlreadyFinished);
    assert_eq!(service.calls(OperationKind::Commit), 1);
}

#[test]
fn test_execute_after_commit_fails() {
    let service = Arc::new(ScriptedService::new());
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::occ()).unwrap();

    tx.commit(CommitType::Default).unwrap();
    let err = tx.execute_statement("UPDATE t SET v = 2", &[]).unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::AlreadyFinished);
    assert!(service.statements().is_empty());
}

#[test]
fn test_close_with_unresolved_results() {
    let service = Arc::new(ScriptedService::new());
    service
        .on_close(OperationKind::Result, CloseReply::Fail(TxError::internal("result close")))
        .on_close(OperationKind::Result, CloseReply::Ok)
        .on_dispose(Reply::err(TxError::internal("dispose")));
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::occ()).unwrap();

    let first = tx.execute_statement("UPDATE a SET v = 1", &[]).unwrap();
    let second = tx.execute_statement("UPDATE b SET v = 1", &[]).unwrap();
    assert_eq!(first.status(), ResultStatus::Pending);

    let err = tx.close().unwrap_err();
    assert_eq!(err.message(), "dispose");
    assert_eq!(err.suppressed().len(), 1);
    assert_eq!(err.suppressed()[0].message(), "result close");

    assert_eq!(first.status(), ResultStatus::Closed);
    assert_eq!(second.status(), ResultStatus::Closed);
    assert_eq!(service.closes(OperationKind::Result), 2);
    assert_eq!(session.open_transactions(), 0);
}

#[test]
fn test_result_failures_aggregated_when_dispose_succeeds() {
    let service = Arc::new(ScriptedService::new());
    service
        .on_close(OperationKind::Result, CloseReply::Fail(TxError::internal("r1")))
        .on_close(OperationKind::Result, CloseReply::Fail(TxError::internal("r2")));
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::occ()).unwrap();
    tx.execute_statement("UPDATE a SET v = 1", &[]).unwrap();
    tx.execute_statement("UPDATE b SET v = 1", &[]).unwrap();

    let err = tx.close().unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::AggregatedClose);
    assert_eq!(err.cause().unwrap().message(), "r1");
    assert_eq!(err.suppressed().len(), 1);
    assert_eq!(service.calls(OperationKind::TransactionClose), 1);
}

#[test]
fn test_session_close_closes_hierarchy() {
    let service = Arc::new(ScriptedService::new());
    let session = session(&service);

    let tx = session.create_transaction(TransactionOption::occ()).unwrap();
    let result = tx.execute_query("SELECT * FROM t", &[]).unwrap();
    let idle = session.create_transaction(TransactionOption::rtx()).unwrap();

    session.close().unwrap();

    assert_eq!(result.status(), ResultStatus::Closed);
    assert!(tx.state().is_closed());
    assert!(idle.state().is_closed());
    assert_eq!(service.open_responses(), 0);
    assert_eq!(
        tx.commit(CommitType::Default).unwrap_err().kind(),
        &ErrorKind::AlreadyClosed
    );
}

#[test]
fn test_session_close_ends_pending_begin() {
    let service = Arc::new(ScriptedService::new());
    service.on_begin(Reply::Never);
    let session = session(&service);
    let tx = Arc::new(session.create_transaction(TransactionOption::occ()).unwrap());

    let waiter = {
        let tx = Arc::clone(&tx);
        std::thread::spawn(move || tx.transaction_id())
    };
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    session.close().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::AlreadyClosed);
    assert!(tx.state().is_closed());
    assert_eq!(service.closes(OperationKind::Begin), 1);
    assert_eq!(service.open_responses(), 0);
}

#[test]
fn test_status_and_explain() {
    let service = Arc::new(ScriptedService::new());
    service.on_status(Reply::ok(TransactionStatus::aborted(
        ServerCode::cc_exception(),
        "conflict",
    )));
    let session = session(&service);
    let tx = session.create_transaction(TransactionOption::occ()).unwrap();

    let status = tx.status().unwrap();
    assert!(status.is_error());
    assert_eq!(status.diagnostic, Some(ServerCode::cc_exception()));

    let plan = tx.explain("SELECT * FROM t", &[]).unwrap();
    assert_eq!(plan.contents, "SELECT * FROM t");
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TransactionListener for EventLog {
    fn transaction_id_obtained(&self, _tx: &TransactionInfo, _transaction_id: &str) {
        self.push("id".into());
    }

    fn execute_start(&self, _tx: &TransactionInfo, execute_id: u64, _sql: &str, _params: &[Parameter]) {
        self.push(format!("execute_start:{}", execute_id));
    }

    fn execute_end(&self, _tx: &TransactionInfo, execute_id: u64, error: Option<&TxError>) {
        self.push(format!("execute_end:{}:{}", execute_id, error.is_none()));
    }

    fn commit_start(&self, _tx: &TransactionInfo, _commit_type: CommitType) {
        self.push("commit_start".into());
    }

    fn commit_end(&self, tx: &TransactionInfo, _commit_type: CommitType, error: Option<&TxError>) {
        assert!(tx.transaction_id.is_some());
        self.push(format!("commit_end:{}", error.is_none()));
    }

    fn closed(&self, _tx: &TransactionInfo, error: Option<&TxError>) {
        self.push(format!("closed:{}", error.is_none()));
    }
}

#[test]
fn test_transaction_listener_events() {
    let service = Arc::new(ScriptedService::new());
    let log = Arc::new(EventLog::default());
    let session = Session::builder(Arc::clone(&service) as Arc<dyn SqlService>)
        .listener(Arc::clone(&log) as Arc<dyn TransactionListener>)
        .build()
        .unwrap();

    let tx = session.create_transaction(TransactionOption::occ()).unwrap();
    tx.execute_and_get_count("UPDATE t SET v = 1", &[]).unwrap();
    tx.commit(CommitType::Default).unwrap();
    tx.close().unwrap();

    assert_eq!(
        log.events(),
        vec![
            "id",
            "execute_start:1",
            "execute_end:1:true",
            "commit_start",
            "commit_end:true",
            "closed:true",
        ]
    );
}
