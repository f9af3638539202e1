use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{Error, QueryFailure, Result};
use crate::future::OpFuture;
use crate::key::ConnectionKey;
use crate::logging::QueryLoggingData;
use crate::operation::{
    complete_with, on_start, request_cancel, run_operation, timeout_now, ConnectionProxy,
    OperationBase, OperationImpl, OperationState,
};
use crate::protocol::{Flow, Interest};
use crate::socket::SocketHandler;

enum SessionCommand {
    Reset,
    ChangeUser {
        user: String,
        password: String,
        database: String,
    },
}

impl SessionCommand {
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Reset => "reset",
            SessionCommand::ChangeUser { .. } => "change_user",
        }
    }
}

enum Next {
    Arm(Interest),
    Fail {
        code: u16,
        message: String,
        status: crate::protocol::ServerStatus,
    },
    Finished,
}

/// Single-command session operations: `COM_RESET_CONNECTION` and
/// `COM_CHANGE_USER`.
pub(crate) struct SessionInner {
    base: OperationBase,
    command: SessionCommand,
    key: ConnectionKey,
    proxy: Mutex<Option<ConnectionProxy>>,
    tx: Mutex<Option<oneshot::Sender<Result<Connection>>>>,
}

impl SessionInner {
    /// `add_to_pending: false` leaves registration to the caller; the
    /// dying-connection path registers from inside the reactor hop, right
    /// before `run`, so shutdown cannot observe the operation in the
    /// pending set while it also sits on the to-remove list.
    fn build(
        mut proxy: ConnectionProxy,
        command: SessionCommand,
        add_to_pending: bool,
    ) -> std::result::Result<Arc<SessionInner>, (Error, Connection)> {
        let conn = proxy.conn_mut();
        let client = conn.client_inner();
        let key = conn.key().clone();
        let options = conn.options().clone();
        let socket = conn.socket_handler();

        let timeout = match command {
            SessionCommand::Reset => options.get_query_timeout(),
            // Longer than the connect timeout so a change-user cannot race
            // the connect deadline itself.
            SessionCommand::ChangeUser { .. } => {
                let connect = options.get_connect_timeout();
                if connect > Duration::ZERO {
                    connect + Duration::from_secs(1)
                } else {
                    Duration::ZERO
                }
            }
        };

        let name = command.name();
        let inner = Arc::new(SessionInner {
            base: OperationBase::new(client, name),
            command,
            key,
            proxy: Mutex::new(None),
            tx: Mutex::new(None),
        });

        inner.base.set_timeout(timeout);
        if let Some(socket) = socket {
            socket.set_operation(inner.clone());
        }
        *inner.proxy.lock() = Some(proxy);

        if add_to_pending {
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
        }
        Ok(inner)
    }

    fn drive(self: &Arc<Self>) {
        let next = {
            let mut proxy = self.proxy.lock();
            let conn = proxy
                .as_mut()
                .expect("connection present while driving")
                .conn_mut();

            let flow = {
                let holder = conn.holder_mut().expect("holder present while driving");
                match &self.command {
                    SessionCommand::Reset => holder.handle.reset(),
                    SessionCommand::ChangeUser {
                        user,
                        password,
                        database,
                    } => holder.handle.change_user(user, password, database),
                }
            };

            match flow {
                Flow::Pending(interest) => Next::Arm(interest),
                Flow::Error => {
                    let holder = conn.holder_mut().expect("holder present while driving");
                    Next::Fail {
                        code: holder.handle.error_code(),
                        message: holder.handle.error_message(),
                        status: holder.handle.server_status(),
                    }
                }
                Flow::Done => {
                    match &self.command {
                        SessionCommand::Reset => {
                            let holder =
                                conn.holder_mut().expect("holder present while driving");
                            holder.clear_needs_reset();
                        }
                        SessionCommand::ChangeUser {
                            user,
                            password,
                            database,
                        } => {
                            let new_key = self.key.with_user(
                                user.clone(),
                                password.clone(),
                                database.clone(),
                            );
                            conn.holder_mut()
                                .expect("holder present while driving")
                                .set_key(new_key.clone());
                            conn.set_key(new_key);
                        }
                    }
                    Next::Finished
                }
            }
        };

        match next {
            Next::Arm(interest) => self.arm_socket(interest),
            Next::Fail {
                code,
                message,
                status,
            } => {
                complete_with(
                    &**self,
                    Some(Error::Query(QueryFailure {
                        queries_executed: 0,
                        status,
                        code,
                        message,
                        key: self.key.clone(),
                        elapsed: self.base.elapsed(),
                    })),
                );
            }
            Next::Finished => complete_with(&**self, None),
        }
    }

    /// Register the socket on first use and arm for readiness; an adopted
    /// connection (or one whose steps never pended before) reaches its
    /// first registration here.
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

    fn take_back_connection(&self) -> Option<Connection> {
        self.proxy.lock().take().map(ConnectionProxy::into_connection)
    }
}

impl OperationImpl for SessionInner {
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
        self.drive();
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
            operation: self.command.name(),
            num_queries: 0,
            elapsed: self.base.elapsed(),
            key: self.key.clone(),
            attributes: Default::default(),
        };

        match &error {
            None => {
                if let Some(logger) = &client.db_logger {
                    logger.log_query_success(&data);
                }
            }
            Some(err) => {
                if let Some(proxy) = self.proxy.lock().as_mut() {
                    proxy.conn_mut().mark_not_reusable();
                }
                if let Some(logger) = &client.db_logger {
                    logger.log_query_failure(
                        &data,
                        err.server_errno().unwrap_or(0),
                        &err.to_string(),
                    );
                }
            }
        }

        if let Some(tx) = self.tx.lock().take() {
            let payload = match error {
                None => self
                    .take_back_connection()
                    .ok_or_else(|| Error::client("connection already taken from this operation")),
                Some(error) => {
                    drop(self.take_back_connection());
                    Err(error)
                }
            };
            let _ = tx.send(payload);
        }
    }
}

macro_rules! session_op_common {
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

        /// Single-consumer future yielding the connection back after the
        /// command completes. Register before `run`.
        pub fn future(&self) -> OpFuture<Connection> {
            let (tx, future) = OpFuture::channel();
            *self.inner.tx.lock() = Some(tx);
            future
        }

        /// The connection handed back after completion. `None` until the
        /// operation completed, or when it was already taken (e.g. by a
        /// registered future).
        pub fn take_back_connection(&self) -> Option<Connection> {
            self.inner.take_back_connection()
        }
    };
}

/// `COM_RESET_CONNECTION` on an owned connection.
#[derive(Clone)]
pub struct ResetOperation {
    pub(crate) inner: Arc<SessionInner>,
}

impl ResetOperation {
    pub(crate) fn build(
        proxy: ConnectionProxy,
    ) -> std::result::Result<Self, (Error, Connection)> {
        SessionInner::build(proxy, SessionCommand::Reset, true).map(|inner| Self { inner })
    }

    /// Variant for the dying-connection path: not registered with the
    /// client; the caller registers it on the reactor thread immediately
    /// before `run`.
    pub(crate) fn build_deferred(proxy: ConnectionProxy) -> Self {
        let inner = SessionInner::build(proxy, SessionCommand::Reset, false)
            .unwrap_or_else(|_| unreachable!("deferred build does not register"));
        Self { inner }
    }

    session_op_common!();
}

/// `COM_CHANGE_USER` on an owned connection. On success the connection and
/// holder keys are rewritten to the new credentials.
#[derive(Clone)]
pub struct ChangeUserOperation {
    pub(crate) inner: Arc<SessionInner>,
}

impl ChangeUserOperation {
    pub(crate) fn build(
        proxy: ConnectionProxy,
        user: String,
        password: String,
        database: String,
    ) -> std::result::Result<Self, (Error, Connection)> {
        SessionInner::build(
            proxy,
            SessionCommand::ChangeUser {
                user,
                password,
                database,
            },
            true,
        )
        .map(|inner| Self { inner })
    }

    session_op_common!();
}
