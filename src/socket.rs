//! Per-connection reactor attachment.
//!
//! A [`SocketHandler`] owns the registration of one socket with the
//! reactor and a single-shot timeout, and is bound to at most one
//! operation at a time. Readiness and timer callbacks are delivered on the
//! reactor thread only.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest as TokioInterest;
use tokio::sync::Notify;

use crate::operation::{OperationImpl, OperationState};
use crate::protocol::Interest;

struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Clone)]
pub(crate) struct SocketHandler {
    shared: Arc<SocketShared>,
}

struct SocketShared {
    afd: Mutex<Option<Arc<AsyncFd<SocketFd>>>>,
    bound: Mutex<Option<Arc<dyn OperationImpl>>>,
    // Bumping a generation invalidates the in-flight wait of that kind;
    // the notify reaps the superseded task so it releases its registration.
    arm_generation: AtomicU64,
    timer_generation: AtomicU64,
    wake_ready: Notify,
    wake_timer: Notify,
}

impl SocketHandler {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SocketShared {
                afd: Mutex::new(None),
                bound: Mutex::new(None),
                arm_generation: AtomicU64::new(0),
                timer_generation: AtomicU64::new(0),
                wake_ready: Notify::new(),
                wake_timer: Notify::new(),
            }),
        }
    }

    /// Register the socket with the reactor. Reactor thread only: the
    /// registration needs the runtime context.
    pub(crate) fn set_fd(&self, fd: RawFd) -> std::io::Result<()> {
        let afd = AsyncFd::with_interest(
            SocketFd(fd),
            TokioInterest::READABLE | TokioInterest::WRITABLE,
        )?;
        *self.shared.afd.lock() = Some(Arc::new(afd));
        Ok(())
    }

    pub(crate) fn has_fd(&self) -> bool {
        self.shared.afd.lock().is_some()
    }

    /// Bind the operation that readiness and timeout events dispatch to.
    pub(crate) fn set_operation(&self, op: Arc<dyn OperationImpl>) {
        *self.shared.bound.lock() = Some(op);
    }

    /// Drop the binding and invalidate any in-flight waits. Called on the
    /// operation's terminal transition.
    pub(crate) fn disarm(&self) {
        self.shared.arm_generation.fetch_add(1, Ordering::SeqCst);
        self.shared.timer_generation.fetch_add(1, Ordering::SeqCst);
        self.shared.bound.lock().take();
        self.shared.wake_ready.notify_waiters();
        self.shared.wake_timer.notify_waiters();
    }

    /// Wait for socket readiness, then dispatch to the bound operation.
    /// Reactor thread only. A newer `arm` or a `disarm` supersedes the
    /// wait.
    pub(crate) fn arm(&self, interest: Interest) {
        let generation = self.shared.arm_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.wake_ready.notify_waiters();
        let afd = self
            .shared
            .afd
            .lock()
            .clone()
            .expect("socket readiness requested before the socket descriptor was set");
        let shared = Arc::clone(&self.shared);

        tokio::task::spawn_local(async move {
            tokio::select! {
                ready = wait_interest(&afd, interest) => {
                    if shared.arm_generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    if let Ok(mut guard) = ready {
                        // The protocol step drained the socket before it
                        // reported Pending; readiness must be re-observed
                        // from scratch next time.
                        guard.clear_ready();
                    }
                    dispatch_readiness(&shared);
                }
                _ = shared.wake_ready.notified() => {}
            }
        });
    }

    /// Arm the single-shot operation timeout. Reactor thread only.
    pub(crate) fn schedule_timeout(&self, deadline: Instant) {
        let generation = self.shared.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.wake_timer.notify_waiters();
        let shared = Arc::clone(&self.shared);

        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    if shared.timer_generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    let op = shared.bound.lock().clone();
                    if let Some(op) = op {
                        op.timeout_triggered();
                    }
                }
                _ = shared.wake_timer.notified() => {}
            }
        });
    }
}

async fn wait_interest<'a>(
    afd: &'a AsyncFd<SocketFd>,
    interest: Interest,
) -> std::io::Result<tokio::io::unix::AsyncFdReadyGuard<'a, SocketFd>> {
    match interest {
        Interest::Read => afd.readable().await,
        Interest::Write => afd.writable().await,
        Interest::ReadWrite => tokio::select! {
            readable = afd.readable() => readable,
            writable = afd.writable() => writable,
        },
    }
}

fn dispatch_readiness(shared: &SocketShared) {
    let op = shared.bound.lock().clone();
    let Some(op) = op else { return };

    match op.base().state() {
        OperationState::Completed | OperationState::Unstarted => {
            // Contract violation: the binding is cleared on terminal
            // transition and never set before run.
            panic!(
                "socket readiness delivered to {} operation in state {:?}",
                op.base().operation_name(),
                op.base().state()
            );
        }
        OperationState::Cancelling => op.finish_cancel(),
        OperationState::Pending => op.socket_actionable(),
    }
}
