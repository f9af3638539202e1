use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::future::OpFuture;
use crate::holder::ConnectionHolder;
use crate::key::ConnectionKey;
use crate::logging::ConnectionLoggingData;
use crate::operation::{
    complete_with, on_start, request_cancel, timeout_now, OperationBase, OperationImpl,
    OperationState,
};
use crate::options::ConnectionOptions;
use crate::protocol::{Flow, ProtocolHandle};
use crate::socket::SocketHandler;

/// Establishes one connection to a MySQL endpoint.
///
/// Constructed by [`Client::begin_connection`]; the connection produced on
/// success is retrieved with [`take_connection`] or through [`future`].
///
/// [`Client::begin_connection`]: crate::client::Client::begin_connection
/// [`take_connection`]: ConnectOperation::take_connection
/// [`future`]: ConnectOperation::future
#[derive(Clone)]
pub struct ConnectOperation {
    pub(crate) inner: Arc<ConnectInner>,
}

pub(crate) struct ConnectInner {
    base: OperationBase,
    key: ConnectionKey,
    options: Mutex<ConnectionOptions>,
    handle: Mutex<Option<Box<dyn ProtocolHandle>>>,
    socket: SocketHandler,
    fd_registered: AtomicBool,
    // Whether this operation still holds the active-connection slot it
    // reserved at run; ownership moves to the holder on success.
    counted: AtomicBool,
    conn_out: Mutex<Option<Connection>>,
    tx: Mutex<Option<oneshot::Sender<Result<Connection>>>>,
}

impl ConnectOperation {
    pub(crate) fn build(client: Arc<ClientInner>, key: ConnectionKey) -> Result<Self> {
        let inner = Arc::new(ConnectInner {
            base: OperationBase::new(client, "connect"),
            key,
            options: Mutex::new(ConnectionOptions::default()),
            handle: Mutex::new(None),
            socket: SocketHandler::new(),
            fd_registered: AtomicBool::new(false),
            counted: AtomicBool::new(false),
            conn_out: Mutex::new(None),
            tx: Mutex::new(None),
        });
        inner
            .base
            .set_timeout(inner.options.lock().effective_connect_timeout());
        inner.socket.set_operation(inner.clone());
        if let Err(error) = inner.base.client.clone().add_operation(inner.clone()) {
            inner.socket.disarm();
            return Err(error);
        }
        Ok(Self { inner })
    }

    pub fn set_connection_options(&self, options: ConnectionOptions) -> &Self {
        self.inner
            .base
            .set_timeout(options.effective_connect_timeout());
        *self.inner.options.lock() = options;
        self
    }

    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        self.inner.base.set_timeout(timeout);
        self
    }

    /// Single-consumer future for the connection. Register before `run` to
    /// avoid racing completion.
    pub fn future(&self) -> OpFuture<Connection> {
        let (tx, future) = OpFuture::channel();
        *self.inner.tx.lock() = Some(tx);
        future
    }

    pub fn run(&self) -> &Self {
        {
            let mut state = self.inner.base.state.lock();
            if *state != OperationState::Unstarted {
                return self;
            }
            *state = OperationState::Pending;
            // Reserve the active-connection slot before the first protocol
            // step; shutdown waits on it until the attempt resolves.
            self.inner.counted.store(true, Ordering::SeqCst);
            self.inner.base.client.connection_opened(&self.inner.key);
        }
        *self.inner.base.started.lock() = Some(std::time::Instant::now());
        let client = self.inner.base.client.clone();
        let scheduled = {
            let inner = self.inner.clone();
            client.run_in_thread(move || inner.start_on_reactor())
        };
        if !scheduled {
            complete_with(
                &*self.inner,
                Some(Error::client("client reactor is not running")),
            );
        }
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

    /// The established connection, after [`wait`] returned.
    ///
    /// [`wait`]: ConnectOperation::wait
    pub fn take_connection(&self) -> Result<Connection> {
        if let Some(error) = self.inner.base.error() {
            return Err(error);
        }
        self.inner
            .conn_out
            .lock()
            .take()
            .ok_or_else(|| Error::client("connection already taken from this operation"))
    }
}

impl ConnectInner {
    fn drive(self: &Arc<Self>) {
        enum Step {
            Arm(crate::protocol::Interest),
            RegisterFd(std::os::fd::RawFd, crate::protocol::Interest),
            Fail { code: u16, message: String },
            Connected(Box<dyn ProtocolHandle>),
        }

        let step = {
            let mut slot = self.handle.lock();
            if slot.is_none() {
                let options = self.options.lock().clone();
                match self.base.client.driver.init_handle(&self.key, &options) {
                    Ok(handle) => *slot = Some(handle),
                    Err(error) => {
                        drop(slot);
                        self.release_slot();
                        complete_with(&**self, Some(error));
                        return;
                    }
                }
            }
            let handle = slot.as_mut().expect("handle initialized above");
            let options = self.options.lock().clone();
            let flags = options.get_client_flags();
            match handle.try_connect(&options, &self.key, flags) {
                Flow::Pending(interest) => {
                    if self.fd_registered.load(Ordering::SeqCst) {
                        Step::Arm(interest)
                    } else {
                        Step::RegisterFd(handle.socket(), interest)
                    }
                }
                Flow::Error => Step::Fail {
                    code: handle.error_code(),
                    message: handle.error_message(),
                },
                Flow::Done => Step::Connected(slot.take().expect("handle present")),
            }
        };

        match step {
            Step::Arm(interest) => self.socket.arm(interest),

            Step::RegisterFd(fd, interest) => {
                if let Err(error) = self.socket.set_fd(fd) {
                    self.release_slot();
                    complete_with(
                        &**self,
                        Some(Error::client(format!(
                            "failed to register socket with the reactor: {}",
                            error
                        ))),
                    );
                    return;
                }
                self.fd_registered.store(true, Ordering::SeqCst);
                self.socket.arm(interest);
            }

            Step::Fail { code, message } => {
                self.release_slot();
                complete_with(
                    &**self,
                    Some(Error::ConnectFailed {
                        code,
                        message,
                        key: self.key.clone(),
                    }),
                );
            }

            Step::Connected(handle) => {
                // The holder takes over the active-connection slot; from
                // here the slot is released when the holder drops.
                self.counted.store(false, Ordering::SeqCst);
                let holder = ConnectionHolder::new(
                    self.base.client.clone(),
                    self.key.clone(),
                    handle,
                );
                let conn = Connection::from_parts(
                    self.base.client.clone(),
                    self.key.clone(),
                    self.options.lock().clone(),
                    holder,
                    self.socket.clone(),
                );
                *self.conn_out.lock() = Some(conn);
                complete_with(&**self, None);
            }
        }
    }

    /// Release the reserved active-connection slot, once.
    fn release_slot(&self) {
        if self.counted.swap(false, Ordering::SeqCst) {
            self.base.client.connection_closed(&self.key);
        }
    }
}

impl OperationImpl for ConnectInner {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn socket_handler(&self) -> Option<SocketHandler> {
        Some(self.socket.clone())
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
        let data = ConnectionLoggingData {
            elapsed: self.base.elapsed(),
            key: self.key.clone(),
        };
        let client = &self.base.client;

        match &error {
            None => {
                if let Some(logger) = &client.db_logger {
                    logger.log_connection_success(&data);
                }
            }
            Some(error) => {
                self.release_slot();
                client
                    .stats
                    .incr_failed_connections(error.server_errno().unwrap_or(0));
                if let Some(logger) = &client.db_logger {
                    logger.log_connection_failure(&data, error.server_errno().unwrap_or(0), &error.to_string());
                }
            }
        }

        if let Some(tx) = self.tx.lock().take() {
            let outcome = match error {
                None => self
                    .conn_out
                    .lock()
                    .take()
                    .ok_or_else(|| Error::client("connection already taken from this operation")),
                Some(error) => Err(error),
            };
            let _ = tx.send(outcome);
        }
    }
}
