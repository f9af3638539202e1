//! Connection façade behavior: blocking and owned query paths, streaming,
//! session commands, per-connection callbacks, and the dying-connection
//! reset protocol.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::{default_options, harness, test_key};
use futures::FutureExt;
use skein::testing::{QueryScript, ResultScript};
use skein::{
    Callbacks, Connection, ConnectionOptions, Error, OperationState, QueryOptions, QueryOutcome,
};

#[test]
fn query_failure_reports_server_error_and_poisons_reuse() {
    let h = harness();
    h.driver.on_query(
        "SELECT broken",
        QueryScript::Fail {
            code: 1064,
            message: "You have an error in your SQL syntax".to_owned(),
        },
    );

    let mut conn = h.client.connect(test_key(), default_options()).unwrap();
    let err = conn.query("SELECT broken").unwrap_err();

    match err {
        Error::Query(failure) => {
            assert_eq!(failure.code, 1064);
            assert_eq!(failure.queries_executed, 0);
            assert!(failure.message.contains("SQL syntax"));
        }
        other => panic!("expected Query failure, got {:?}", other),
    }

    // The façade got its connection back, but the session must not be
    // pooled again.
    assert!(conn.ok());
    assert!(!conn.is_reusable());
    assert_eq!(h.stats.failed_queries(), 1);
    assert_eq!(h.logger.query_failures(), 1);
}

#[test]
fn multi_query_collects_per_statement_results() {
    let h = harness();
    h.driver.on_query(
        "SELECT 1;UPDATE t SET x = 1",
        QueryScript::Results(vec![
            ResultScript::rows(&["1"], &[&["1"]]),
            ResultScript::ok(3),
        ]),
    );

    let mut conn = h.client.connect(test_key(), default_options()).unwrap();
    let result = conn
        .multi_query(vec!["SELECT 1".to_owned(), "UPDATE t SET x = 1".to_owned()])
        .unwrap();

    assert_eq!(result.num_queries_executed(), 2);
    assert_eq!(result.results().len(), 2);
    assert_eq!(result.results()[0].num_rows(), 1);
    assert_eq!(result.results()[1].num_rows_affected(), 3);
}

#[test]
fn empty_multi_query_fails_without_protocol_calls() {
    let h = harness();
    let mut conn = h.client.connect(test_key(), default_options()).unwrap();
    let handles_before = h.driver.handles_opened();

    let err = conn.multi_query(Vec::new()).unwrap_err();
    match err {
        Error::Client(message) => {
            assert_eq!(&*message, "Given vector of queries is empty")
        }
        other => panic!("expected client error, got {:?}", other),
    }

    // No new protocol activity, and the connection is still usable.
    assert_eq!(h.driver.handles_opened(), handles_before);
    assert!(conn.ok());
    conn.query("SELECT 1").unwrap();
}

#[test]
fn cancel_in_flight_query_terminates_once() {
    let h = harness();
    h.driver.on_query("SELECT SLEEP(1)", QueryScript::Hang);

    let mut conn = h.client.connect(test_key(), default_options()).unwrap();

    let terminal_callbacks = Arc::new(AtomicUsize::new(0));
    let counter = terminal_callbacks.clone();
    conn.set_callbacks(Callbacks {
        post_operation: Some(Arc::new(move |_report| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Callbacks::default()
    });

    let (holder_tx, holder_rx) = mpsc::channel();
    conn.set_dying_callback(Box::new(move |holder| {
        let _ = holder_tx.send(holder.is_reusable());
    }));

    let op = Connection::begin_query(conn, "SELECT SLEEP(1)").unwrap();
    op.run();
    thread::sleep(Duration::from_millis(50));
    op.cancel();
    op.wait();

    assert!(matches!(op.error(), Some(Error::Cancelled)));
    assert_eq!(op.state(), OperationState::Completed);
    assert_eq!(terminal_callbacks.load(Ordering::SeqCst), 1);

    // Dropping the operation releases the owned connection into its dying
    // callback; a cancelled session is not reusable.
    drop(op);
    let reusable = holder_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(!reusable);
}

#[test]
fn query_timeout_expires_at_deadline() {
    let h = harness();
    h.driver.on_query("SELECT SLEEP(1)", QueryScript::Hang);

    let options = ConnectionOptions::new().query_timeout(Duration::from_millis(20));
    let mut conn = h.client.connect(test_key(), options).unwrap();

    let started = Instant::now();
    let err = conn.query("SELECT SLEEP(1)").unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(conn.ok());
    assert!(!conn.is_reusable());
}

#[test]
fn zero_query_timeout_means_no_timeout() {
    let h = harness();
    h.driver.on_query("SELECT SLEEP(1)", QueryScript::Hang);

    // query_timeout stays zero: nothing may fire on its own.
    let conn = h.client.connect(test_key(), default_options()).unwrap();
    let op = Connection::begin_query(conn, "SELECT SLEEP(1)").unwrap();
    op.run();

    thread::sleep(Duration::from_millis(60));
    assert_eq!(op.state(), OperationState::Pending);

    op.cancel();
    op.wait();
    assert!(matches!(op.error(), Some(Error::Cancelled)));
}

#[test]
fn transactions_ride_the_query_path() {
    let h = harness();
    let mut conn = h.client.connect(test_key(), default_options()).unwrap();

    conn.begin_transaction().unwrap();
    assert!(conn.in_transaction());

    conn.commit_transaction().unwrap();
    assert!(!conn.in_transaction());

    conn.begin_transaction().unwrap();
    conn.rollback_transaction().unwrap();
    assert!(!conn.in_transaction());

    // Each statement was an ordinary query as far as accounting goes.
    assert_eq!(h.stats.succeeded_queries(), 4);
    assert_eq!(h.logger.query_successes(), 4);
}

#[test]
fn streaming_multi_query_pulls_rows_per_statement() {
    let h = harness();
    h.driver.on_query(
        "SELECT a;SELECT b",
        QueryScript::Results(vec![
            ResultScript {
                columns: vec!["a".to_owned()],
                rows: vec![vec![Some("1".to_owned())], vec![Some("2".to_owned())]],
                pendings: 1,
                ..ResultScript::default()
            },
            ResultScript::rows(&["b"], &[&["3"]]),
        ]),
    );

    let conn = h.client.connect(test_key(), default_options()).unwrap();
    let mut stream = Connection::stream_multi_query(
        conn,
        vec!["SELECT a".to_owned(), "SELECT b".to_owned()],
    )
    .unwrap();

    let mut seen = Vec::new();
    while stream.next_query().unwrap() {
        while let Some(row) = stream.next_row().unwrap() {
            seen.push(row.as_str(0).unwrap().to_owned());
        }
    }

    assert_eq!(seen, vec!["1", "2", "3"]);
}

#[test]
fn empty_streaming_multi_query_fails_immediately() {
    let h = harness();
    let conn = h.client.connect(test_key(), default_options()).unwrap();

    let mut stream = Connection::stream_multi_query(conn, Vec::new()).unwrap();
    match stream.next_query() {
        Err(Error::Client(message)) => {
            assert_eq!(&*message, "Given vector of queries is empty")
        }
        other => panic!("expected client error, got {:?}", other),
    }
}

#[test]
fn reset_and_change_user_round_trip() {
    let h = harness();
    let conn = h.client.connect(test_key(), default_options()).unwrap();

    let conn = Connection::reset(conn).unwrap();
    assert_eq!(h.driver.reset_count(), 1);

    let conn = Connection::change_user(conn, "admin", "s3cret", "ops").unwrap();
    assert_eq!(h.driver.change_user_count(), 1);
    assert_eq!(conn.key().user, "admin");
    assert_eq!(conn.key().database, "ops");
}

#[test]
fn dying_connection_resets_before_recycle() {
    let h = harness();
    let options = ConnectionOptions::new().reset_conn_before_close(true);
    let mut conn = h.client.connect(test_key(), options).unwrap();

    let (holder_tx, holder_rx) = mpsc::channel();
    conn.set_dying_callback(Box::new(move |holder| {
        let _ = holder_tx.send(holder);
    }));

    conn.query("SELECT 1").unwrap();
    assert_eq!(h.driver.reset_count(), 0);

    // Dropping from a non-reactor thread blocks until the reset ran.
    drop(conn);
    assert_eq!(h.driver.reset_count(), 1);

    let holder = holder_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(holder.is_reusable());
    assert!(!holder.needs_reset_before_reuse());
}

#[test]
fn dying_connection_on_reactor_defers_the_reset() {
    let h = harness();
    let options = ConnectionOptions::new()
        .reset_conn_before_close(true)
        .delayed_reset_conn(true);
    let mut conn = h.client.connect(test_key(), options).unwrap();

    let (holder_tx, holder_rx) = mpsc::channel();
    conn.set_dying_callback(Box::new(move |holder| {
        let _ = holder_tx.send(holder);
    }));

    assert!(h.client.run_in_thread(move || drop(conn)));

    let holder = holder_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(h.driver.reset_count(), 0);
    assert!(holder.needs_reset_before_reuse());
}

#[test]
fn dying_connection_without_reset_option_recycles_directly() {
    let h = harness();
    let mut conn = h.client.connect(test_key(), default_options()).unwrap();

    let (holder_tx, holder_rx) = mpsc::channel();
    conn.set_dying_callback(Box::new(move |holder| {
        let _ = holder_tx.send(holder);
    }));

    drop(conn);
    let _holder = holder_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(h.driver.reset_count(), 0);
}

#[test]
fn in_transaction_connection_skips_the_dying_reset() {
    let h = harness();
    let options = ConnectionOptions::new().reset_conn_before_close(true);
    let mut conn = h.client.connect(test_key(), options).unwrap();

    let (holder_tx, holder_rx) = mpsc::channel();
    conn.set_dying_callback(Box::new(move |holder| {
        let _ = holder_tx.send(holder);
    }));

    conn.begin_transaction().unwrap();
    assert!(conn.in_transaction());

    drop(conn);
    let _holder = holder_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(h.driver.reset_count(), 0);
}

#[test]
fn query_attributes_ride_the_operation() {
    let h = harness();
    let conn = h.client.connect(test_key(), default_options()).unwrap();

    let op = Connection::begin_query(conn, "SELECT 1").unwrap();
    op.set_attributes(QueryOptions::new().attribute("trace_id", "abc123"));
    op.run().wait();

    assert!(op.ok());
    assert_eq!(op.attributes().get("trace_id").map(String::as_str), Some("abc123"));
}

#[test]
fn pre_and_post_query_callbacks_wrap_the_operation() {
    let h = harness();
    h.driver.on_query(
        "SELECT 1",
        QueryScript::Results(vec![ResultScript::rows(&["1"], &[&["1"]])]),
    );

    let pre_calls = Arc::new(AtomicUsize::new(0));
    let post_calls = Arc::new(AtomicUsize::new(0));

    let mut conn = h.client.connect(test_key(), default_options()).unwrap();
    let pre = pre_calls.clone();
    let post = post_calls.clone();
    conn.set_callbacks(Callbacks {
        pre_query: Some(Arc::new(move |_sql| {
            let pre = pre.clone();
            async move {
                pre.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })),
        post_query: Some(Arc::new(move |outcome| {
            let post = post.clone();
            async move {
                post.fetch_add(1, Ordering::SeqCst);
                outcome
            }
            .boxed()
        })),
        ..Callbacks::default()
    });

    let result = conn.query("SELECT 1").unwrap();
    assert_eq!(result.rows()[0].as_str(0), Some("1"));
    assert_eq!(pre_calls.load(Ordering::SeqCst), 1);
    assert_eq!(post_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn post_query_callback_can_transform_the_result() {
    let h = harness();
    h.driver.on_query(
        "SELECT 1",
        QueryScript::Results(vec![ResultScript::rows(&["1"], &[&["1"]])]),
    );

    let mut conn = h.client.connect(test_key(), default_options()).unwrap();
    conn.set_callbacks(Callbacks {
        post_query: Some(Arc::new(|outcome| {
            async move {
                match outcome {
                    QueryOutcome::Query(result) => QueryOutcome::Query(result),
                    QueryOutcome::MultiQuery(result) => QueryOutcome::MultiQuery(result),
                }
            }
            .boxed()
        })),
        ..Callbacks::default()
    });

    let result = conn.query("SELECT 1").unwrap();
    assert_eq!(result.num_rows(), 1);
}
