use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::connection::{Connection, PostQueryCallback, PreQueryCallback};
use crate::error::{Error, QueryFailure, Result};
use crate::future::OpFuture;
use crate::key::ConnectionKey;
use crate::logging::QueryLoggingData;
use crate::operation::{
    complete_with, on_start, request_cancel, run_operation, timeout_now, ConnectionProxy,
    OperationBase, OperationImpl, OperationState,
};
use crate::options::QueryOptions;
use crate::protocol::{Fetched, Flow, Interest, RowCursor, ServerStatus};
use crate::query_result::{DbMultiQueryResult, DbQueryResult, QueryOutcome, StatementResult};
use crate::socket::SocketHandler;
use crate::stream::{StreamEvent, StreamShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPhase {
    /// Sending the query string.
    Execute,
    /// Obtaining the cursor for the current result set.
    InitResult,
    /// Pulling rows from the cursor.
    FetchRows,
    /// Statement boundary: commit counters, maybe advance to the next
    /// result set.
    AfterStatement,
}

pub(crate) enum FetchMode {
    Single,
    Multi,
    Stream(Arc<StreamShared>),
}

enum ResultSink {
    /// Results stay on the operation; the blocking façade pulls them.
    Blocking,
    QueryFuture(oneshot::Sender<Result<(DbQueryResult, Connection)>>),
    MultiFuture(oneshot::Sender<Result<(DbMultiQueryResult, Connection)>>),
}

struct FetchState {
    phase: FetchPhase,
    cursor: Option<Box<dyn RowCursor>>,
    current: StatementResult,
    results: Vec<StatementResult>,
    queries_executed: u32,
    status: ServerStatus,
    /// Result after the `post_query` callback ran, kept until publication.
    final_outcome: Option<QueryOutcome>,
    /// Successful outcome parked for the blocking façade.
    published: Option<QueryOutcome>,
}

enum Next {
    Arm(Interest),
    Fail {
        code: u16,
        message: String,
        status: ServerStatus,
    },
    Finished,
}

pub(crate) struct FetchInner {
    base: OperationBase,
    sql: String,
    num_statements: usize,
    mode: FetchMode,
    key: ConnectionKey,
    proxy: Mutex<Option<ConnectionProxy>>,
    st: Mutex<FetchState>,
    pre_query: Mutex<Option<PreQueryCallback>>,
    post_query: Mutex<Option<PostQueryCallback>>,
    sink: Mutex<ResultSink>,
    attributes: Mutex<HashMap<String, String>>,
}

impl FetchInner {
    /// Wire up a fetch operation on the proxied connection and register it
    /// with the client. On a refused registration (shutdown in progress)
    /// the connection comes back to the caller.
    pub(crate) fn build(
        mut proxy: ConnectionProxy,
        sql: String,
        num_statements: usize,
        mode: FetchMode,
        name: &'static str,
    ) -> std::result::Result<Arc<FetchInner>, (Error, Connection)> {
        let conn = proxy.conn_mut();
        let client = conn.client_inner();
        let key = conn.key().clone();
        let query_timeout = conn.options().get_query_timeout();
        let callbacks = conn.callbacks().clone();
        let socket = conn.socket_handler();

        let inner = Arc::new(FetchInner {
            base: OperationBase::new(client, name),
            sql,
            num_statements,
            mode,
            key,
            proxy: Mutex::new(None),
            st: Mutex::new(FetchState {
                phase: FetchPhase::Execute,
                cursor: None,
                current: StatementResult::default(),
                results: Vec::new(),
                queries_executed: 0,
                status: ServerStatus::default(),
                final_outcome: None,
                published: None,
            }),
            pre_query: Mutex::new(callbacks.pre_query),
            post_query: Mutex::new(callbacks.post_query),
            sink: Mutex::new(ResultSink::Blocking),
            attributes: Mutex::new(HashMap::new()),
        });

        inner.base.set_timeout(query_timeout);
        *inner.base.pre_operation.lock() = callbacks.pre_operation;
        *inner.base.post_operation.lock() = callbacks.post_operation;
        if let Some(socket) = socket {
            socket.set_operation(inner.clone());
        }
        *inner.proxy.lock() = Some(proxy);

        if let Err(error) = inner.base.client.clone().add_operation(inner.clone()) {
            let conn = inner
                .proxy
                .lock()
                .take()
                .expect("connection still proxied")
                .into_connection();
            if let Some(socket) = conn.socket_handler() {
                socket.disarm();
            }
            return Err((error, conn));
        }
        Ok(inner)
    }

    /// Run protocol steps until the operation must wait, fail, or finish.
    /// Reactor thread only.
    fn steps(&self) -> Next {
        let mut proxy = self.proxy.lock();
        let conn = proxy
            .as_mut()
            .expect("connection present while driving")
            .conn_mut();
        let holder = conn
            .holder_mut()
            .expect("holder present while driving");
        let mut st = self.st.lock();

        loop {
            match st.phase {
                FetchPhase::Execute => match holder.handle.run_query(&self.sql) {
                    Flow::Pending(interest) => return Next::Arm(interest),
                    Flow::Error => {
                        return Next::Fail {
                            code: holder.handle.error_code(),
                            message: holder.handle.error_message(),
                            status: holder.handle.server_status(),
                        }
                    }
                    Flow::Done => st.phase = FetchPhase::InitResult,
                },

                FetchPhase::InitResult => match holder.handle.use_result() {
                    Some(cursor) => {
                        st.cursor = Some(cursor);
                        st.phase = FetchPhase::FetchRows;
                    }
                    None => {
                        st.current.num_rows_affected = holder.handle.affected_rows();
                        st.current.last_insert_id = holder.handle.last_insert_id();
                        st.phase = FetchPhase::AfterStatement;
                    }
                },

                FetchPhase::FetchRows => {
                    let fetched = st
                        .cursor
                        .as_mut()
                        .expect("cursor present while fetching")
                        .fetch_row();
                    match fetched {
                        Fetched::Pending(interest) => return Next::Arm(interest),
                        Fetched::Row(row) => match &self.mode {
                            FetchMode::Stream(stream) => stream.push(StreamEvent::Row(row)),
                            _ => st.current.rows.push(row),
                        },
                        Fetched::Done => {
                            st.cursor = None;
                            st.current.num_rows_affected = holder.handle.affected_rows();
                            st.current.last_insert_id = holder.handle.last_insert_id();
                            st.phase = FetchPhase::AfterStatement;
                        }
                    }
                }

                FetchPhase::AfterStatement => {
                    st.status = holder.handle.server_status();
                    st.queries_executed += 1;
                    let finished = mem::take(&mut st.current);
                    match &self.mode {
                        FetchMode::Stream(stream) => {
                            stream.push(StreamEvent::QueryEnd(finished))
                        }
                        _ => st.results.push(finished),
                    }

                    if !holder.handle.more_results() {
                        return Next::Finished;
                    }
                    match holder.handle.next_result() {
                        Flow::Pending(interest) => return Next::Arm(interest),
                        Flow::Error => {
                            return Next::Fail {
                                code: holder.handle.error_code(),
                                message: holder.handle.error_message(),
                                status: holder.handle.server_status(),
                            }
                        }
                        Flow::Done => st.phase = FetchPhase::InitResult,
                    }
                }
            }
        }
    }

    /// Register the socket on first use and arm for readiness. The fd is
    /// only registered lazily: a connection cloned for a dying reset (or
    /// adopted from outside) reaches its first pending step here.
    fn arm_socket(self: &Arc<Self>, interest: Interest) {
        let Some(socket) = self.socket_handler() else { return };
        if !socket.has_fd() {
            let fd = self
                .proxy
                .lock()
                .as_mut()
                .and_then(|proxy| proxy.conn_mut().holder_mut().map(|h| h.handle.socket()));
            if let Some(fd) = fd {
                if let Err(error) = socket.set_fd(fd) {
                    complete_with(
                        &**self,
                        Some(Error::client(format!(
                            "failed to register socket with the reactor: {}",
                            error
                        ))),
                    );
                    return;
                }
            }
        }
        socket.arm(interest);
    }

    fn drive(self: &Arc<Self>) {
        match self.steps() {
            Next::Arm(interest) => self.arm_socket(interest),

            Next::Fail {
                code,
                message,
                status,
            } => {
                let queries_executed = self.st.lock().queries_executed;
                complete_with(
                    &**self,
                    Some(Error::Query(QueryFailure {
                        queries_executed,
                        status,
                        code,
                        message,
                        key: self.key.clone(),
                        elapsed: self.base.elapsed(),
                    })),
                );
            }

            Next::Finished => self.finish_success(),
        }
    }

    fn finish_success(self: &Arc<Self>) {
        let post = self.post_query.lock().take();
        let post = match (&self.mode, post) {
            (FetchMode::Stream(_), _) | (_, None) => {
                complete_with(&**self, None);
                return;
            }
            (_, Some(post)) => post,
        };

        // The callback is a deferred continuation: the operation stays
        // live (and cancellable) until it resolves.
        let outcome = self.make_outcome();
        let op = Arc::clone(self);
        tokio::task::spawn_local(async move {
            let transformed = post(outcome).await;
            op.st.lock().final_outcome = Some(transformed);
            complete_with(&*op, None);
        });
    }

    fn make_outcome(&self) -> QueryOutcome {
        let mut st = self.st.lock();
        if let Some(outcome) = st.final_outcome.take() {
            return outcome;
        }
        let elapsed = self.base.elapsed();
        match self.mode {
            FetchMode::Single => {
                let result = st.results.drain(..).next().unwrap_or_default();
                QueryOutcome::Query(DbQueryResult {
                    result,
                    num_queries_executed: st.queries_executed,
                    status: st.status,
                    key: self.key.clone(),
                    elapsed,
                })
            }
            _ => QueryOutcome::MultiQuery(DbMultiQueryResult {
                results: mem::take(&mut st.results),
                num_queries_executed: st.queries_executed,
                status: st.status,
                key: self.key.clone(),
                elapsed,
            }),
        }
    }

    fn take_back_connection(&self) -> Option<Connection> {
        self.proxy.lock().take().map(ConnectionProxy::into_connection)
    }
}

impl OperationImpl for FetchInner {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn socket_handler(&self) -> Option<SocketHandler> {
        self.proxy
            .lock()
            .as_ref()
            .and_then(|proxy| proxy.conn().socket_handler())
    }

    fn start_on_reactor(self: Arc<Self>) {
        if !on_start(&self) {
            return;
        }
        let pre = self.pre_query.lock().take();
        match pre {
            None => self.drive(),
            Some(pre) => {
                let deferred = pre(&self.sql);
                let op = Arc::clone(&self);
                tokio::task::spawn_local(async move {
                    deferred.await;
                    match op.base.state() {
                        OperationState::Pending => op.drive(),
                        OperationState::Cancelling => Arc::clone(&op).finish_cancel(),
                        _ => {}
                    }
                });
            }
        }
    }

    fn socket_actionable(self: Arc<Self>) {
        self.drive();
    }

    fn timeout_triggered(self: Arc<Self>) {
        timeout_now(&*self);
    }

    fn finish_cancel(self: Arc<Self>) {
        complete_with(&*self, Some(Error::Cancelled));
    }

    fn publish_result(&self) {
        let error = self.base.error();
        let client = self.base.client.clone();

        let data = QueryLoggingData {
            operation: self.base.operation_name(),
            num_queries: self.num_statements,
            elapsed: self.base.elapsed(),
            key: self.key.clone(),
            attributes: self.attributes.lock().clone(),
        };

        match &error {
            None => {
                client.stats.incr_succeeded_queries();
                if let Some(logger) = &client.db_logger {
                    logger.log_query_success(&data);
                }
            }
            Some(err) => {
                // A failed or cancelled operation leaves the session in an
                // unknown state; the connection must not be pooled again.
                // An operation that never ran left the wire untouched.
                let touched_wire = self.base.started.lock().is_some();
                if touched_wire {
                    if let Some(proxy) = self.proxy.lock().as_mut() {
                        proxy.conn_mut().mark_not_reusable();
                    }
                }
                client.stats.incr_failed_queries(err.server_errno().unwrap_or(0));
                if let Some(logger) = &client.db_logger {
                    logger.log_query_failure(
                        &data,
                        err.server_errno().unwrap_or(0),
                        &err.to_string(),
                    );
                }
            }
        }

        // Route the outcome into whichever surface is consuming it.
        let sink = mem::replace(&mut *self.sink.lock(), ResultSink::Blocking);
        match sink {
            ResultSink::Blocking => {
                if error.is_none() && !matches!(self.mode, FetchMode::Stream(_)) {
                    let outcome = self.make_outcome();
                    self.st.lock().published = Some(outcome);
                }
                // Referenced connections stay proxied until the façade
                // takes them back.
            }

            ResultSink::QueryFuture(tx) => {
                let payload = match &error {
                    None => {
                        let conn = self
                            .take_back_connection()
                            .expect("owned connection present at completion");
                        match self.make_outcome() {
                            QueryOutcome::Query(result) => Ok((result, conn)),
                            QueryOutcome::MultiQuery(_) => {
                                unreachable!("single-query operation produced a multi-query result")
                            }
                        }
                    }
                    Some(ref error) => {
                        drop(self.take_back_connection());
                        Err(error.clone())
                    }
                };
                let _ = tx.send(payload);
            }

            ResultSink::MultiFuture(tx) => {
                let payload = match &error {
                    None => {
                        let conn = self
                            .take_back_connection()
                            .expect("owned connection present at completion");
                        match self.make_outcome() {
                            QueryOutcome::MultiQuery(result) => Ok((result, conn)),
                            QueryOutcome::Query(_) => {
                                unreachable!("multi-query operation produced a single-query result")
                            }
                        }
                    }
                    Some(error) => {
                        drop(self.take_back_connection());
                        Err(error.clone())
                    }
                };
                let _ = tx.send(payload);
            }
        }

        if let FetchMode::Stream(stream) = &self.mode {
            drop(self.take_back_connection());
            match error {
                None => stream.push(StreamEvent::Done {
                    status: self.st.lock().status,
                }),
                Some(error) => stream.push(StreamEvent::Failed(error)),
            }
        }
    }
}

macro_rules! fetch_op_common {
    () => {
        pub fn run(&self) -> &Self {
            run_operation(self.inner.clone());
            self
        }

        pub fn wait(&self) -> &Self {
            self.inner.base.wait();
            self
        }

        pub fn cancel(&self) {
            request_cancel(self.inner.clone());
        }

        pub fn state(&self) -> OperationState {
            self.inner.base.state()
        }

        pub fn ok(&self) -> bool {
            self.inner.base.ok()
        }

        pub fn error(&self) -> Option<Error> {
            self.inner.base.error()
        }

        pub fn elapsed(&self) -> Duration {
            self.inner.base.elapsed()
        }

        pub fn set_timeout(&self, timeout: Duration) -> &Self {
            self.inner.base.set_timeout(timeout);
            self
        }

        /// Attach per-query attributes; they surface in the operation's
        /// query logging data.
        pub fn set_attributes(&self, options: QueryOptions) -> &Self {
            *self.inner.attributes.lock() = options.attributes;
            self
        }

        pub fn attributes(&self) -> HashMap<String, String> {
            self.inner.attributes.lock().clone()
        }

        pub fn num_queries_executed(&self) -> u32 {
            self.inner.st.lock().queries_executed
        }

        /// The connection handed back after completion. `None` until the
        /// operation completed, or when it was already taken (e.g. by a
        /// registered future).
        pub fn take_back_connection(&self) -> Option<Connection> {
            self.inner.take_back_connection()
        }
    };
}

/// One single-statement query.
#[derive(Clone)]
pub struct QueryOperation {
    pub(crate) inner: Arc<FetchInner>,
}

impl QueryOperation {
    pub(crate) fn build(
        proxy: ConnectionProxy,
        sql: String,
    ) -> std::result::Result<Self, (Error, Connection)> {
        FetchInner::build(proxy, sql, 1, FetchMode::Single, "query")
            .map(|inner| Self { inner })
    }

    fetch_op_common!();

    /// Single-consumer future yielding the result and the owned
    /// connection. Register before `run`.
    pub fn future(&self) -> OpFuture<(DbQueryResult, Connection)> {
        let (tx, future) = OpFuture::channel();
        *self.inner.sink.lock() = ResultSink::QueryFuture(tx);
        future
    }

    /// The frozen result, after `wait` returned.
    pub fn take_query_result(&self) -> Result<DbQueryResult> {
        if let Some(error) = self.inner.base.error() {
            return Err(error);
        }
        match self.inner.st.lock().published.take() {
            Some(QueryOutcome::Query(result)) => Ok(result),
            _ => Err(Error::client("query result already taken")),
        }
    }
}

/// Several statements executed in one round trip, results collected per
/// statement.
#[derive(Clone)]
pub struct MultiQueryOperation {
    pub(crate) inner: Arc<FetchInner>,
}

impl MultiQueryOperation {
    pub(crate) fn build(
        proxy: ConnectionProxy,
        queries: Vec<String>,
    ) -> std::result::Result<Self, (Error, Connection)> {
        let num_statements = queries.len();
        let sql = queries.join(";");
        FetchInner::build(proxy, sql, num_statements, FetchMode::Multi, "multi_query")
            .map(|inner| Self { inner })
    }

    fetch_op_common!();

    pub fn future(&self) -> OpFuture<(DbMultiQueryResult, Connection)> {
        let (tx, future) = OpFuture::channel();
        *self.inner.sink.lock() = ResultSink::MultiFuture(tx);
        future
    }

    pub fn take_multi_query_result(&self) -> Result<DbMultiQueryResult> {
        if let Some(error) = self.inner.base.error() {
            return Err(error);
        }
        match self.inner.st.lock().published.take() {
            Some(QueryOutcome::MultiQuery(result)) => Ok(result),
            _ => Err(Error::client("multi-query result already taken")),
        }
    }
}

/// Several statements whose rows are pulled through a
/// [`MultiQueryStreamHandler`] instead of being collected.
///
/// [`MultiQueryStreamHandler`]: crate::stream::MultiQueryStreamHandler
#[derive(Clone)]
pub struct MultiQueryStreamOperation {
    pub(crate) inner: Arc<FetchInner>,
}

impl MultiQueryStreamOperation {
    pub(crate) fn build(
        proxy: ConnectionProxy,
        queries: Vec<String>,
        stream: Arc<StreamShared>,
    ) -> std::result::Result<Self, (Error, Connection)> {
        let num_statements = queries.len();
        let sql = queries.join(";");
        FetchInner::build(
            proxy,
            sql,
            num_statements,
            FetchMode::Stream(stream),
            "multi_query_stream",
        )
        .map(|inner| Self { inner })
    }

    fetch_op_common!();
}

impl FetchInner {
    pub(crate) fn set_client_error_and_cancel(self: &Arc<Self>, message: &'static str) {
        self.base.set_client_error(message);
        request_cancel(self.clone() as Arc<dyn OperationImpl>);
    }
}
