//! Operation state machines.
//!
//! Every request against a client (connect, query, multi-query, streaming
//! multi-query, reset, change-user) is an operation: constructed
//! `Unstarted`, moved to `Pending` by `run`, driven by socket readiness on
//! the reactor thread until `Completed`. Cancellation from any thread
//! routes through `Cancelling` and terminates on the next reactor
//! callback.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::error::Error;
use crate::future::Completion;
use crate::socket::SocketHandler;

mod connect;
mod fetch;
mod special;

pub use connect::ConnectOperation;
pub use fetch::{MultiQueryOperation, MultiQueryStreamOperation, QueryOperation};
pub use special::{ChangeUserOperation, ResetOperation};

/// Lifecycle of an operation. Transitions are monotonic; `Completed` is
/// terminal and never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Unstarted,
    Pending,
    Cancelling,
    Completed,
}

/// Snapshot handed to the per-connection `pre_operation` /
/// `post_operation` callbacks.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: &'static str,
    pub state: OperationState,
    pub elapsed: Duration,
}

pub type OperationCallback = Arc<dyn Fn(&OperationReport) + Send + Sync>;

/// The operation's relation to its connection: `Owned` drops (or returns)
/// the connection with the operation, `Referenced` gives it back to the
/// borrowing caller when the operation completes.
pub(crate) enum ConnectionProxy {
    Owned(Connection),
    Referenced(Connection),
}

impl ConnectionProxy {
    pub(crate) fn conn(&self) -> &Connection {
        match self {
            ConnectionProxy::Owned(conn) | ConnectionProxy::Referenced(conn) => conn,
        }
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        match self {
            ConnectionProxy::Owned(conn) | ConnectionProxy::Referenced(conn) => conn,
        }
    }

    pub(crate) fn into_connection(self) -> Connection {
        match self {
            ConnectionProxy::Owned(conn) | ConnectionProxy::Referenced(conn) => conn,
        }
    }
}

/// State shared by every operation kind.
pub(crate) struct OperationBase {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) id: u64,
    name: &'static str,
    pub(crate) state: Mutex<OperationState>,
    pub(crate) in_pending_set: AtomicBool,
    pub(crate) timeout: Mutex<Option<Duration>>,
    created: Instant,
    pub(crate) started: Mutex<Option<Instant>>,
    ended: Mutex<Option<Instant>>,
    pub(crate) failure: Mutex<Option<Error>>,
    pub(crate) completion: Completion,
    pub(crate) pre_operation: Mutex<Option<OperationCallback>>,
    pub(crate) post_operation: Mutex<Option<OperationCallback>>,
}

impl OperationBase {
    pub(crate) fn new(client: Arc<ClientInner>, name: &'static str) -> Self {
        let id = client.next_operation_id();
        Self {
            client,
            id,
            name,
            state: Mutex::new(OperationState::Unstarted),
            in_pending_set: AtomicBool::new(false),
            timeout: Mutex::new(None),
            created: Instant::now(),
            started: Mutex::new(None),
            ended: Mutex::new(None),
            failure: Mutex::new(None),
            completion: Completion::default(),
            pre_operation: Mutex::new(None),
            post_operation: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> OperationState {
        *self.state.lock()
    }

    pub(crate) fn operation_name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = if timeout > Duration::ZERO {
            Some(timeout)
        } else {
            None
        };
    }

    /// Time from `run` (or construction, if never run) to the terminal
    /// transition, or to now for a live operation.
    pub(crate) fn elapsed(&self) -> Duration {
        let start = self.started.lock().unwrap_or(self.created);
        let end = self.ended.lock().unwrap_or_else(Instant::now);
        end.saturating_duration_since(start)
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    pub(crate) fn ok(&self) -> bool {
        self.state() == OperationState::Completed && self.failure.lock().is_none()
    }

    /// Pre-set the failure slot; the first recorded error is the one the
    /// terminal transition keeps.
    pub(crate) fn set_client_error(&self, message: &'static str) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(Error::client(message));
        }
    }

    fn report(&self) -> OperationReport {
        OperationReport {
            operation: self.name,
            state: self.state(),
            elapsed: self.elapsed(),
        }
    }

    /// Block the calling thread until the operation completes. Calling
    /// this from the reactor thread would deadlock the event loop, which
    /// makes it a programming bug, not an error.
    pub(crate) fn wait(&self) {
        if !self.completion.is_done() {
            assert!(
                !self.client.on_reactor_thread(),
                "blocking wait on a {} operation from the reactor thread",
                self.name
            );
        }
        self.completion.wait();
    }
}

/// Dispatch surface the reactor and the socket handler drive. Implemented
/// by each operation kind.
pub(crate) trait OperationImpl: Send + Sync + 'static {
    fn base(&self) -> &OperationBase;

    /// The socket handler of the connection this operation is bound to,
    /// when one exists.
    fn socket_handler(&self) -> Option<SocketHandler>;

    /// First reactor callback after `run`.
    fn start_on_reactor(self: Arc<Self>);

    /// Socket readiness arrived while `Pending`.
    fn socket_actionable(self: Arc<Self>);

    /// The operation deadline expired.
    fn timeout_triggered(self: Arc<Self>);

    /// Terminal cleanup after a cancel request was observed.
    fn finish_cancel(self: Arc<Self>);

    /// Kind-specific terminal bookkeeping: freeze the result, feed stats
    /// and the structured logger, fulfil the future. Runs exactly once,
    /// before waiters are released.
    fn publish_result(&self);
}

/// Terminal transition. Exactly one caller wins; everyone else returns.
///
/// `failure` loses to an earlier recorded error (an empty multi-query
/// records its client error before cancelling, and keeps it).
pub(crate) fn complete_with<T: OperationImpl + ?Sized>(op: &T, failure: Option<Error>) {
    let base = op.base();
    {
        let mut state = base.state.lock();
        if *state == OperationState::Completed {
            return;
        }
        *state = OperationState::Completed;
    }
    {
        let mut slot = base.failure.lock();
        if slot.is_none() {
            *slot = failure;
        }
    }
    *base.ended.lock() = Some(Instant::now());

    if let Some(socket) = op.socket_handler() {
        socket.disarm();
    }

    op.publish_result();

    let post = base.post_operation.lock().clone();
    if let Some(post) = post {
        post(&base.report());
    }

    base.completion.notify();
    base.client
        .defer_remove_operation(base.id, &base.in_pending_set);
}

pub(crate) fn timeout_now<T: OperationImpl + ?Sized>(op: &T) {
    let elapsed = op.base().elapsed();
    complete_with(op, Some(Error::Timeout { elapsed }));
}

/// Cancel from any thread. Idempotent: repeat requests collapse into the
/// state check.
pub(crate) fn request_cancel(op: Arc<dyn OperationImpl>) {
    let client;
    {
        let base = op.base();
        let mut state = base.state.lock();
        match *state {
            OperationState::Completed => return,
            OperationState::Unstarted => {
                drop(state);
                complete_with(&*op, Some(Error::Cancelled));
                return;
            }
            OperationState::Pending | OperationState::Cancelling => {
                *state = OperationState::Cancelling;
                client = base.client.clone();
            }
        }
    }
    let on_reactor = {
        let op = Arc::clone(&op);
        client.run_in_thread(move || op.finish_cancel())
    };
    if !on_reactor {
        // The reactor is gone; terminate in place.
        complete_with(&*op, Some(Error::Cancelled));
    }
}

/// `Unstarted` → `Pending`, then hop to the reactor for the first protocol
/// step. A no-op for an operation that already left `Unstarted` (e.g.
/// cancelled before run).
pub(crate) fn run_operation<T: OperationImpl>(op: Arc<T>) {
    {
        let mut state = op.base().state.lock();
        if *state != OperationState::Unstarted {
            return;
        }
        *state = OperationState::Pending;
    }
    *op.base().started.lock() = Some(Instant::now());
    let client = op.base().client.clone();
    let scheduled = {
        let op = Arc::clone(&op);
        client.run_in_thread(move || op.start_on_reactor())
    };
    if !scheduled {
        complete_with(&*op, Some(Error::client("client reactor is not running")));
    }
}

/// Common prologue of `start_on_reactor`: observe a cancel that raced
/// ahead, fire `pre_operation`, arm the deadline. Returns `false` when the
/// operation is no longer runnable.
pub(crate) fn on_start<T: OperationImpl>(op: &Arc<T>) -> bool {
    let base = op.base();
    match base.state() {
        OperationState::Cancelling => {
            Arc::clone(op).finish_cancel();
            return false;
        }
        OperationState::Completed => return false,
        OperationState::Unstarted | OperationState::Pending => {}
    }

    let pre = base.pre_operation.lock().clone();
    if let Some(pre) = pre {
        pre(&base.report());
    }

    if let Some(timeout) = *base.timeout.lock() {
        let started = base.started.lock().unwrap_or_else(Instant::now);
        if let Some(socket) = op.socket_handler() {
            socket.schedule_timeout(started + timeout);
        }
    }

    true
}
