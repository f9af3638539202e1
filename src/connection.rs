use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::future::OpFuture;
use crate::holder::{ConnectionDyingCallback, ConnectionHolder};
use crate::key::ConnectionKey;
use crate::operation::{
    ChangeUserOperation, ConnectionProxy, MultiQueryOperation, MultiQueryStreamOperation,
    OperationCallback, QueryOperation, ResetOperation,
};
use crate::options::ConnectionOptions;
use crate::query_result::{DbMultiQueryResult, DbQueryResult, QueryOutcome};
use crate::socket::SocketHandler;
use crate::stream::{MultiQueryStreamHandler, StreamShared};

/// Runs before the first protocol step of a query-class operation; the
/// operation waits for the returned future before touching the wire.
pub type PreQueryCallback = Arc<dyn Fn(&str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transforms a successful result before it is published.
pub type PostQueryCallback =
    Arc<dyn Fn(QueryOutcome) -> BoxFuture<'static, QueryOutcome> + Send + Sync>;

/// Per-connection user callbacks. Absent callbacks are no-ops.
#[derive(Default, Clone)]
pub struct Callbacks {
    pub pre_operation: Option<OperationCallback>,
    pub post_operation: Option<OperationCallback>,
    pub pre_query: Option<PreQueryCallback>,
    pub post_query: Option<PostQueryCallback>,
}

pub(crate) struct ConnectionInner {
    key: ConnectionKey,
    options: ConnectionOptions,
    holder: Option<ConnectionHolder>,
    socket: SocketHandler,
    callbacks: Callbacks,
    dying_callback: Option<ConnectionDyingCallback>,
    operation_in_progress: bool,
    // Cleared on the clone a dying connection makes for its final reset,
    // so the clone itself goes straight to recycling.
    needs_clone_for_reset: bool,
}

/// A live connection to a MySQL server.
///
/// At most one operation runs on a connection at a time. Blocking calls
/// borrow the connection for their duration; `begin_*` constructors and
/// the future variants take ownership and hand it back on completion.
pub struct Connection {
    pub(crate) client: Arc<ClientInner>,
    inner: Option<Box<ConnectionInner>>,
}

impl Connection {
    pub(crate) fn from_parts(
        client: Arc<ClientInner>,
        key: ConnectionKey,
        options: ConnectionOptions,
        holder: ConnectionHolder,
        socket: SocketHandler,
    ) -> Self {
        Self {
            client,
            inner: Some(Box::new(ConnectionInner {
                key,
                options,
                holder: Some(holder),
                socket,
                callbacks: Callbacks::default(),
                dying_callback: None,
                operation_in_progress: false,
                needs_clone_for_reset: true,
            })),
        }
    }

    /// Endpoint this connection was opened against.
    ///
    /// Panics if the connection was consumed by an owned operation.
    pub fn key(&self) -> &ConnectionKey {
        &self.inner.as_ref().expect("connection has been consumed").key
    }

    /// Whether the connection holds a usable protocol handle.
    pub fn ok(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |inner| inner.holder.is_some())
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self
            .inner
            .as_ref()
            .expect("connection has been consumed")
            .options
    }

    pub fn in_transaction(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|inner| inner.holder.as_ref())
            .map_or(false, ConnectionHolder::in_transaction)
    }

    pub fn is_reusable(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|inner| inner.holder.as_ref())
            .map_or(false, ConnectionHolder::is_reusable)
    }

    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        if let Some(inner) = self.inner.as_mut() {
            inner.callbacks = callbacks;
        }
    }

    /// Install the recycler invoked with the holder when this connection is
    /// destroyed.
    pub fn set_dying_callback(&mut self, callback: ConnectionDyingCallback) {
        if let Some(inner) = self.inner.as_mut() {
            inner.dying_callback = Some(callback);
        }
    }

    pub(crate) fn client_inner(&self) -> Arc<ClientInner> {
        self.client.clone()
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self
            .inner
            .as_ref()
            .expect("connection has been consumed")
            .callbacks
    }

    pub(crate) fn socket_handler(&self) -> Option<SocketHandler> {
        self.inner.as_ref().map(|inner| inner.socket.clone())
    }

    pub(crate) fn holder_mut(&mut self) -> Option<&mut ConnectionHolder> {
        self.inner.as_mut().and_then(|inner| inner.holder.as_mut())
    }

    pub(crate) fn mark_not_reusable(&mut self) {
        if let Some(holder) = self.holder_mut() {
            holder.set_reusable(false);
        }
    }

    pub(crate) fn set_key(&mut self, key: ConnectionKey) {
        if let Some(inner) = self.inner.as_mut() {
            inner.key = key;
        }
    }

    fn check_usable(&self) -> Result<()> {
        if !self.ok() {
            return Err(Error::InvalidConnection);
        }
        Ok(())
    }

    fn check_operation_in_progress(&self) -> Result<()> {
        let in_progress = self
            .inner
            .as_ref()
            .map_or(false, |inner| inner.operation_in_progress);
        if in_progress {
            return Err(Error::OperationInProgress);
        }
        Ok(())
    }

    fn set_in_progress(&mut self, value: bool) {
        if let Some(inner) = self.inner.as_mut() {
            inner.operation_in_progress = value;
        }
    }

    /// Move the guts into a temporary connection the operation can borrow;
    /// the façade object stays behind, unusable until restored.
    fn steal_for_borrow(&mut self) -> Connection {
        Connection {
            client: self.client.clone(),
            inner: self.inner.take(),
        }
    }

    fn restore_from(&mut self, mut borrowed: Connection) {
        self.inner = borrowed.inner.take();
    }

    fn validate_for_query(conn: &Connection) -> Result<()> {
        conn.check_usable()?;
        conn.check_operation_in_progress()
    }

    // ---- owned operation constructors ------------------------------------

    /// Begin a single query on an owned connection. On error the
    /// connection is dropped (and recycled through its dying callback).
    pub fn begin_query(conn: Connection, query: impl Into<String>) -> Result<QueryOperation> {
        Self::validate_for_query(&conn)?;
        QueryOperation::build(ConnectionProxy::Owned(conn), query.into())
            .map_err(|(error, _conn)| error)
    }

    /// Begin a multi-statement query. An empty statement list produces an
    /// operation that completes immediately with a client error, without
    /// touching the wire.
    pub fn begin_multi_query(
        conn: Connection,
        queries: Vec<String>,
    ) -> Result<MultiQueryOperation> {
        Self::validate_for_query(&conn)?;
        let is_empty = queries.is_empty();
        let op = MultiQueryOperation::build(ConnectionProxy::Owned(conn), queries)
            .map_err(|(error, _conn)| error)?;
        if is_empty {
            op.inner
                .set_client_error_and_cancel("Given vector of queries is empty");
        }
        Ok(op)
    }

    /// Begin a streaming multi-query and return the pull handle. The
    /// operation is already running when this returns.
    pub fn stream_multi_query(
        conn: Connection,
        queries: Vec<String>,
    ) -> Result<MultiQueryStreamHandler> {
        Self::validate_for_query(&conn)?;
        let shared = StreamShared::new();
        let is_empty = queries.is_empty();
        let op =
            MultiQueryStreamOperation::build(ConnectionProxy::Owned(conn), queries, shared.clone())
                .map_err(|(error, _conn)| error)?;
        if is_empty {
            op.inner
                .set_client_error_and_cancel("Given vector of queries is empty");
        } else {
            op.run();
        }
        Ok(MultiQueryStreamHandler::new(shared, op))
    }

    pub fn begin_reset(conn: Connection) -> Result<ResetOperation> {
        Self::validate_for_query(&conn)?;
        ResetOperation::build(ConnectionProxy::Owned(conn)).map_err(|(error, _conn)| error)
    }

    pub fn begin_change_user(
        conn: Connection,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<ChangeUserOperation> {
        Self::validate_for_query(&conn)?;
        ChangeUserOperation::build(
            ConnectionProxy::Owned(conn),
            user.into(),
            password.into(),
            database.into(),
        )
        .map_err(|(error, _conn)| error)
    }

    // ---- future variants -------------------------------------------------

    /// Run a query on an owned connection; the future yields the result
    /// and the connection.
    pub fn query_future(
        conn: Connection,
        query: impl Into<String>,
    ) -> Result<OpFuture<(DbQueryResult, Connection)>> {
        let op = Self::begin_query(conn, query)?;
        let future = op.future();
        op.run();
        Ok(future)
    }

    pub fn multi_query_future(
        conn: Connection,
        queries: Vec<String>,
    ) -> Result<OpFuture<(DbMultiQueryResult, Connection)>> {
        let op = Self::begin_multi_query(conn, queries)?;
        let future = op.future();
        op.run();
        Ok(future)
    }

    // ---- blocking variants (borrowed connection) -------------------------

    /// Run one query and wait for the result.
    pub fn query(&mut self, query: impl Into<String>) -> Result<DbQueryResult> {
        self.client.assert_not_reactor()?;
        self.check_usable()?;
        self.check_operation_in_progress()?;

        self.set_in_progress(true);
        let borrowed = self.steal_for_borrow();
        let op = match QueryOperation::build(ConnectionProxy::Referenced(borrowed), query.into()) {
            Ok(op) => op,
            Err((error, conn)) => {
                self.restore_from(conn);
                self.set_in_progress(false);
                return Err(error);
            }
        };

        op.run().wait();
        let result = op.take_query_result();
        if let Some(conn) = op.take_back_connection() {
            self.restore_from(conn);
        }
        self.set_in_progress(false);
        result
    }

    /// Run several statements in one round trip and wait for all results.
    pub fn multi_query(&mut self, queries: Vec<String>) -> Result<DbMultiQueryResult> {
        self.client.assert_not_reactor()?;
        self.check_usable()?;
        self.check_operation_in_progress()?;

        self.set_in_progress(true);
        let is_empty = queries.is_empty();
        let borrowed = self.steal_for_borrow();
        let op = match MultiQueryOperation::build(ConnectionProxy::Referenced(borrowed), queries) {
            Ok(op) => op,
            Err((error, conn)) => {
                self.restore_from(conn);
                self.set_in_progress(false);
                return Err(error);
            }
        };
        if is_empty {
            op.inner
                .set_client_error_and_cancel("Given vector of queries is empty");
        }

        op.run().wait();
        let result = op.take_multi_query_result();
        if let Some(conn) = op.take_back_connection() {
            self.restore_from(conn);
        }
        self.set_in_progress(false);
        result
    }

    /// Reset the server session state, blocking. Returns the connection on
    /// success; on failure the connection is recycled as not reusable.
    pub fn reset(conn: Connection) -> Result<Connection> {
        conn.client.assert_not_reactor()?;
        let op = Self::begin_reset(conn)?;
        op.run().wait();
        match op.error() {
            None => op
                .take_back_connection()
                .ok_or_else(|| Error::client("connection already taken from this operation")),
            Some(error) => {
                drop(op.take_back_connection());
                Err(error)
            }
        }
    }

    /// Switch the session to different credentials, blocking. On success
    /// the connection's key reflects the new user and database.
    pub fn change_user(
        conn: Connection,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<Connection> {
        conn.client.assert_not_reactor()?;
        let op = Self::begin_change_user(conn, user, password, database)?;
        op.run().wait();
        match op.error() {
            None => op
                .take_back_connection()
                .ok_or_else(|| Error::client("connection already taken from this operation")),
            Some(error) => {
                drop(op.take_back_connection());
                Err(error)
            }
        }
    }

    // ---- transactions ----------------------------------------------------

    // Transaction control rides the ordinary query path; the server does
    // the rest.

    pub fn begin_transaction(&mut self) -> Result<DbQueryResult> {
        self.query("BEGIN")
    }

    pub fn commit_transaction(&mut self) -> Result<DbQueryResult> {
        self.query("COMMIT")
    }

    pub fn rollback_transaction(&mut self) -> Result<DbQueryResult> {
        self.query("ROLLBACK")
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Connection");
        match &self.inner {
            Some(inner) => s
                .field("key", &inner.key)
                .field("ok", &inner.holder.is_some())
                .finish(),
            None => s.field("consumed", &true).finish(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else { return };

        let reset_applies = inner.holder.is_some()
            && inner.dying_callback.is_some()
            && inner.needs_clone_for_reset
            && inner.holder.as_ref().is_some_and(|h| h.is_reusable())
            && !inner.holder.as_ref().is_some_and(|h| h.in_transaction())
            && inner.options.is_reset_conn_before_close();

        if reset_applies {
            if !self.client.on_reactor_thread() {
                // Steal the holder into a clone that exists only to carry
                // the final COM_RESET_CONNECTION; the dying callback moves
                // with it and fires after the reset.
                let holder = inner.holder.take().expect("holder checked above");
                let dying = inner.dying_callback.take().expect("callback checked above");

                // The clone inherits this connection's socket handler: the
                // socket stays registered with the reactor exactly once.
                let mut clone = Connection::from_parts(
                    self.client.clone(),
                    holder.key().clone(),
                    inner.options.clone(),
                    holder,
                    inner.socket.clone(),
                );
                clone
                    .inner
                    .as_mut()
                    .expect("freshly built connection")
                    .needs_clone_for_reset = false;
                clone.set_dying_callback(dying);

                let op = ResetOperation::build_deferred(ConnectionProxy::Owned(clone));
                let client = self.client.clone();
                let registered = {
                    let op = op.clone();
                    client.clone().run_in_thread(move || {
                        // Registered here, on the reactor, right before
                        // run: a shutdown sweeping the pending set must
                        // never see this operation while it is still
                        // queued for removal elsewhere.
                        match client.add_operation(op.inner.clone()) {
                            Ok(()) => {
                                op.run();
                            }
                            Err(_) => op.cancel(),
                        }
                    })
                };
                if registered {
                    op.wait();
                }
                // The clone (and with it the dying callback and holder)
                // unwinds through the operation's ownership.
            } else if inner.options.is_delayed_reset_conn() {
                if let Some(holder) = inner.holder.as_mut() {
                    holder.set_needs_reset_before_reuse();
                }
            }
        }

        if let Some(holder) = inner.holder.take() {
            if let Some(dying) = inner.dying_callback.take() {
                dying(holder);
            }
            // No callback: the holder drops here and the native handle
            // closes with it.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::key::ConnectionKey;
    use crate::options::ConnectionOptions;
    use crate::testing::MockDriver;

    fn connected() -> (Client, Connection) {
        let client = Client::new(MockDriver::new());
        let key = ConnectionKey::new("localhost", 3306, "db", "u", "p");
        let conn = client.connect(key, ConnectionOptions::new()).unwrap();
        (client, conn)
    }

    #[test]
    fn stolen_holder_is_an_invalid_connection() {
        let (_client, mut conn) = connected();
        let _stolen = conn.inner.as_mut().unwrap().holder.take();

        match conn.query("SELECT 1") {
            Err(Error::InvalidConnection) => {}
            other => panic!("expected InvalidConnection, got {:?}", other),
        }
    }

    #[test]
    fn busy_connection_refuses_a_second_operation() {
        let (_client, mut conn) = connected();
        conn.inner.as_mut().unwrap().operation_in_progress = true;

        match conn.query("SELECT 1") {
            Err(Error::OperationInProgress) => {}
            other => panic!("expected OperationInProgress, got {:?}", other),
        }

        conn.inner.as_mut().unwrap().operation_in_progress = false;
    }
}
