//! The process front door: one reactor thread per client, submission
//! points for every operation kind, and the two-phase shutdown drain.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::future::OpFuture;
use crate::holder::ConnectionHolder;
use crate::key::ConnectionKey;
use crate::logging::DbLogger;
use crate::operation::{request_cancel, ConnectOperation, OperationImpl, OperationState};
use crate::options::{parse_url, ConnectionOptions};
use crate::protocol::{ProtocolDriver, ProtocolHandle};
use crate::socket::SocketHandler;
use crate::stats::{DbStats, SimpleDbCounter};

static LIBRARY_INIT: Once = Once::new();
static DEFAULT_CLIENT: OnceCell<Client> = OnceCell::new();

enum Job {
    Run {
        f: Box<dyn FnOnce() + Send + 'static>,
        queued: Instant,
    },
    Exit,
}

struct PendingSet {
    ops: HashMap<u64, Arc<dyn OperationImpl>>,
    to_remove: Vec<u64>,
    block_new: bool,
}

#[derive(Default)]
struct ConnCounters {
    active: u64,
    references: HashMap<ConnectionKey, u64>,
}

pub(crate) struct ClientInner {
    pub(crate) driver: Arc<dyn ProtocolDriver>,
    pub(crate) stats: Arc<dyn DbStats>,
    pub(crate) db_logger: Option<Arc<dyn DbLogger>>,
    reactor_tx: mpsc::UnboundedSender<Job>,
    reactor_thread: Mutex<Option<thread::JoinHandle<()>>>,
    reactor_thread_id: thread::ThreadId,
    pending: Mutex<PendingSet>,
    counters: Mutex<ConnCounters>,
    conns_closed: Condvar,
    is_shutdown: AtomicBool,
    next_op_id: AtomicU64,
}

impl ClientInner {
    pub(crate) fn on_reactor_thread(&self) -> bool {
        thread::current().id() == self.reactor_thread_id
    }

    pub(crate) fn assert_not_reactor(&self) -> Result<()> {
        if self.on_reactor_thread() {
            return Err(Error::client(
                "blocking call refused on the reactor thread",
            ));
        }
        Ok(())
    }

    pub(crate) fn next_operation_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` on the reactor thread. From the reactor itself this is the
    /// direct path: `f` runs inline, no cross-thread hop. Returns whether
    /// the closure was accepted.
    pub(crate) fn run_in_thread(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.on_reactor_thread() {
            self.stats.callback_delay_sample(Duration::ZERO);
            f();
            return true;
        }
        self.reactor_tx
            .send(Job::Run {
                f: Box::new(f),
                queued: Instant::now(),
            })
            .is_ok()
    }

    /// Register an operation in the pending set. Refused once shutdown has
    /// entered its blocking phase.
    pub(crate) fn add_operation(self: &Arc<Self>, op: Arc<dyn OperationImpl>) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.block_new {
            return Err(Error::client("client is shutting down"));
        }
        op.base().in_pending_set.store(true, Ordering::SeqCst);
        pending.ops.insert(op.base().id, op);
        Ok(())
    }

    /// Queue a completed operation for removal and schedule the sweep.
    /// Skipped when the operation already left the set (shutdown drain).
    pub(crate) fn defer_remove_operation(
        self: &Arc<Self>,
        id: u64,
        in_pending_set: &AtomicBool,
    ) {
        if !in_pending_set.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().to_remove.push(id);
        let client = self.clone();
        self.run_in_thread(move || client.cleanup_completed_operations());
    }

    fn cleanup_completed_operations(&self) {
        // Collect under the lock, drop outside it: tearing an operation
        // down can cascade into connection teardown, which touches the
        // counters lock.
        let removed: Vec<Arc<dyn OperationImpl>> = {
            let mut pending = self.pending.lock();
            let ids = mem::take(&mut pending.to_remove);
            ids.into_iter()
                .map(|id| {
                    pending
                        .ops
                        .remove(&id)
                        .unwrap_or_else(|| panic!("asked to remove a non-pending operation"))
                })
                .collect()
        };
        drop(removed);
    }

    pub(crate) fn connection_opened(&self, key: &ConnectionKey) {
        let mut counters = self.counters.lock();
        counters.active += 1;
        *counters.references.entry(key.clone()).or_insert(0) += 1;
    }

    pub(crate) fn connection_closed(&self, key: &ConnectionKey) {
        let mut counters = self.counters.lock();
        counters.active = counters.active.saturating_sub(1);
        if let Some(count) = counters.references.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                counters.references.remove(key);
            }
        }
        if counters.active == 0 {
            self.conns_closed.notify_all();
        }
    }

    /// One drain pass: cancel whatever has not started, then wait for
    /// every active connection (including in-flight connects) to close.
    /// The pending lock and the counters lock are taken strictly in
    /// sequence, never together.
    fn drain(&self, block_new: bool) {
        let unstarted: Vec<Arc<dyn OperationImpl>> = {
            let mut pending = self.pending.lock();
            pending.block_new = block_new;

            let ids: Vec<u64> = pending
                .ops
                .iter()
                .filter(|(_, op)| op.base().state() == OperationState::Unstarted)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let op = pending.ops.remove(&id)?;
                    op.base().in_pending_set.store(false, Ordering::SeqCst);
                    Some(op)
                })
                .collect()
        };

        for op in unstarted {
            request_cancel(op);
        }

        let mut counters = self.counters.lock();
        while counters.active > 0 {
            log::debug!(
                target: "skein::client",
                "waiting for {} connections to close before shutting down",
                counters.active
            );
            self.conns_closed.wait(&mut counters);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.reactor_tx.send(Job::Exit);
        if let Some(handle) = self.reactor_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Builder for a [`Client`] with non-default collaborators.
pub struct ClientBuilder {
    driver: Arc<dyn ProtocolDriver>,
    stats: Option<Arc<dyn DbStats>>,
    db_logger: Option<Arc<dyn DbLogger>>,
}

impl ClientBuilder {
    pub fn stats(mut self, stats: Arc<dyn DbStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn db_logger(mut self, logger: Arc<dyn DbLogger>) -> Self {
        self.db_logger = Some(logger);
        self
    }

    pub fn build(self) -> Client {
        let driver = self.driver;
        LIBRARY_INIT.call_once(|| {
            // SSL setup precedes library setup inside the driver.
            driver.global_init();
        });

        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(SimpleDbCounter::new()));

        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let (id_tx, id_rx) = std_mpsc::channel();
        let loop_stats = stats.clone();
        let thread = thread::Builder::new()
            .name("mysql-reactor".to_owned())
            .spawn(move || reactor_main(rx, loop_stats, id_tx))
            .expect("failed to spawn the reactor thread");
        let reactor_thread_id = id_rx
            .recv()
            .expect("reactor thread exited before it started running");

        Client {
            inner: Arc::new(ClientInner {
                driver,
                stats,
                db_logger: self.db_logger,
                reactor_tx: tx,
                reactor_thread: Mutex::new(Some(thread)),
                reactor_thread_id,
                pending: Mutex::new(PendingSet {
                    ops: HashMap::new(),
                    to_remove: Vec::new(),
                    block_new: false,
                }),
                counters: Mutex::new(ConnCounters::default()),
                conns_closed: Condvar::new(),
                is_shutdown: AtomicBool::new(false),
                next_op_id: AtomicU64::new(1),
            }),
        }
    }
}

/// The event loop. Jobs arrive over the channel; socket readiness and
/// timers run as local tasks on the same thread.
fn reactor_main(
    mut rx: mpsc::UnboundedReceiver<Job>,
    stats: Arc<dyn DbStats>,
    id_tx: std_mpsc::Sender<thread::ThreadId>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build the reactor runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let _ = id_tx.send(thread::current().id());
        while let Some(job) = rx.recv().await {
            match job {
                Job::Run { f, queued } => {
                    stats.callback_delay_sample(queued.elapsed());
                    f();
                }
                Job::Exit => break,
            }
        }
    });
}

/// An asynchronous MySQL client.
///
/// Owns one reactor thread; cheap to clone, and every clone shares it.
/// Submission is legal from any thread, including the reactor thread
/// itself (which uses the direct path).
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(driver: Arc<dyn ProtocolDriver>) -> Self {
        Self::builder(driver).build()
    }

    pub fn builder(driver: Arc<dyn ProtocolDriver>) -> ClientBuilder {
        ClientBuilder {
            driver,
            stats: None,
            db_logger: None,
        }
    }

    /// Install the process-wide default client. Fails with the given
    /// client when one is already installed.
    pub fn set_default(client: Client) -> std::result::Result<(), Client> {
        DEFAULT_CLIENT.set(client)
    }

    /// The process-wide default client, when one was installed.
    pub fn default_client() -> Option<Client> {
        DEFAULT_CLIENT.get().cloned()
    }

    /// Begin a connect operation. The operation is registered but not yet
    /// running; configure it, then call `run`.
    pub fn begin_connection(&self, key: ConnectionKey) -> Result<ConnectOperation> {
        ConnectOperation::build(self.inner.clone(), key)
    }

    /// Connect, blocking until the attempt resolves.
    pub fn connect(&self, key: ConnectionKey, options: ConnectionOptions) -> Result<Connection> {
        self.inner.assert_not_reactor()?;
        let op = self.begin_connection(key)?;
        op.set_connection_options(options);
        op.run().wait();
        op.take_connection()
    }

    /// Connect using a `mysql://` URL.
    pub fn connect_url(&self, url: &str) -> Result<Connection> {
        let (key, options) = parse_url(url)?;
        self.connect(key, options)
    }

    /// Connect, returning a future of the established connection.
    pub fn connect_future(
        &self,
        key: ConnectionKey,
        options: ConnectionOptions,
    ) -> Result<OpFuture<Connection>> {
        let op = self.begin_connection(key)?;
        op.set_connection_options(options);
        let future = op.future();
        op.run();
        Ok(future)
    }

    /// Wrap an already-established protocol handle into a connection owned
    /// by this client.
    pub fn adopt_connection(
        &self,
        handle: Box<dyn ProtocolHandle>,
        key: ConnectionKey,
        options: ConnectionOptions,
    ) -> Connection {
        self.inner.connection_opened(&key);
        let holder = ConnectionHolder::new(self.inner.clone(), key.clone(), handle);
        Connection::from_parts(
            self.inner.clone(),
            key,
            options,
            holder,
            SocketHandler::new(),
        )
    }

    /// Enqueue a closure for execution on the reactor thread. Scheduling
    /// latency is recorded into the stats collaborator before the closure
    /// runs.
    pub fn run_in_thread(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.inner.run_in_thread(f)
    }

    /// Whether the calling thread is this client's reactor thread.
    pub fn on_reactor_thread(&self) -> bool {
        self.inner.on_reactor_thread()
    }

    /// Orderly shutdown: cancel unstarted operations, wait for in-flight
    /// work to quiesce, then repeat with new submissions refused, and join
    /// the reactor. Idempotent; a second call returns immediately.
    ///
    /// Calling this from the reactor thread cannot join the loop it is
    /// running on; the thread is detached and an error logged instead.
    pub fn shutdown(&self) {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.inner.on_reactor_thread() {
            log::error!(
                target: "skein::client",
                "shutdown called from the reactor thread; detaching it"
            );
            let _ = self.inner.reactor_tx.send(Job::Exit);
            self.inner.reactor_thread.lock().take();
            return;
        }

        // First pass: operations spawned during the drain (recycle resets
        // from dying connections) are still admitted.
        self.inner.drain(false);
        // Second pass: nothing new gets in.
        self.inner.drain(true);

        {
            let counters = self.inner.counters.lock();
            assert_eq!(
                counters.active, 0,
                "connections still open after shutdown drain"
            );
            assert!(
                counters.references.is_empty(),
                "connection references left after shutdown drain"
            );
        }

        let _ = self.inner.reactor_tx.send(Job::Exit);
        if let Some(handle) = self.inner.reactor_thread.lock().take() {
            let _ = handle.join();
        }

        debug_assert!(self.inner.pending.lock().ops.is_empty());
    }
}
