//! Bridges between operation completion and the two consumption surfaces:
//! a single-consumer future and a blocking wait.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::oneshot;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Completion of one operation, delivered to a single consumer as a future.
///
/// The operation holds the sending half; dropping the operation without
/// completing it (which only happens on client teardown bugs) surfaces as a
/// client error rather than a hang.
pub struct OpFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> OpFuture<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for OpFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(oneshot::Canceled) => {
                Err(Error::client("operation dropped before completing"))
            }
        })
    }
}

/// Waitable completion token: notified exactly once, waitable from any
/// number of threads, any number of times.
#[derive(Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub(crate) fn notify(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_after_notify_from_another_thread() {
        let completion = Arc::new(Completion::default());
        let waiter = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait())
        };

        completion.notify();
        waiter.join().unwrap();
        assert!(completion.is_done());
    }

    #[test]
    fn wait_after_notify_is_immediate() {
        let completion = Completion::default();
        completion.notify();
        completion.wait();
    }
}
