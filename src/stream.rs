//! Pull interface over an in-progress streaming multi-query.
//!
//! The reactor pushes rows and statement boundaries into a shared queue as
//! it fetches them; the consuming thread pulls without ever touching the
//! protocol handle.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::operation::{MultiQueryStreamOperation, OperationImpl, OperationState};
use crate::protocol::ServerStatus;
use crate::query_result::StatementResult;
use crate::row::Row;

pub(crate) enum StreamEvent {
    Row(Row),
    QueryEnd(StatementResult),
    Done { status: ServerStatus },
    Failed(Error),
}

pub(crate) struct StreamShared {
    queue: Mutex<VecDeque<StreamEvent>>,
    cv: Condvar,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn push(&self, event: StreamEvent) {
        self.queue.lock().push_back(event);
        self.cv.notify_all();
    }

    fn pop_blocking(&self) -> StreamEvent {
        let mut queue = self.queue.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            self.cv.wait(&mut queue);
        }
    }

    fn push_front(&self, event: StreamEvent) {
        self.queue.lock().push_front(event);
    }
}

enum Terminal {
    Done { status: ServerStatus },
    Failed(Error),
}

/// User-facing handle over a streaming multi-query.
///
/// Usage: `while handler.next_query()? { while let Some(row) =
/// handler.next_row()? { ... } }`. The handle must outlive the underlying
/// operation; dropping it early blocks until the operation has fully
/// ended.
pub struct MultiQueryStreamHandler {
    shared: Arc<StreamShared>,
    op: MultiQueryStreamOperation,
    terminal: Option<Terminal>,
    last_result: Option<StatementResult>,
}

impl MultiQueryStreamHandler {
    pub(crate) fn new(shared: Arc<StreamShared>, op: MultiQueryStreamOperation) -> Self {
        Self {
            shared,
            op,
            terminal: None,
            last_result: None,
        }
    }

    /// Advance to the next result set. `Ok(false)` once every statement
    /// has been consumed; an error if the operation failed.
    pub fn next_query(&mut self) -> Result<bool> {
        match &self.terminal {
            Some(Terminal::Done { .. }) => return Ok(false),
            Some(Terminal::Failed(error)) => return Err(error.clone()),
            None => {}
        }

        // Peek: a Row or QueryEnd means a result set is open.
        let event = self.shared.pop_blocking();
        match event {
            StreamEvent::Row(_) | StreamEvent::QueryEnd(_) => {
                self.shared.push_front(event);
                Ok(true)
            }
            StreamEvent::Done { status } => {
                self.terminal = Some(Terminal::Done { status });
                Ok(false)
            }
            StreamEvent::Failed(error) => {
                self.terminal = Some(Terminal::Failed(error.clone()));
                Err(error)
            }
        }
    }

    /// The next row of the current result set; `None` at the statement
    /// boundary.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match &self.terminal {
            Some(Terminal::Done { .. }) => return Ok(None),
            Some(Terminal::Failed(error)) => return Err(error.clone()),
            None => {}
        }

        match self.shared.pop_blocking() {
            StreamEvent::Row(row) => Ok(Some(row)),
            StreamEvent::QueryEnd(result) => {
                self.last_result = Some(result);
                Ok(None)
            }
            StreamEvent::Done { status } => {
                self.terminal = Some(Terminal::Done { status });
                Ok(None)
            }
            StreamEvent::Failed(error) => {
                self.terminal = Some(Terminal::Failed(error.clone()));
                Err(error)
            }
        }
    }

    /// Counters of the most recently completed statement.
    pub fn last_statement_result(&self) -> Option<&StatementResult> {
        self.last_result.as_ref()
    }

    /// Server status at successful completion.
    pub fn server_status(&self) -> Option<ServerStatus> {
        match &self.terminal {
            Some(Terminal::Done { status }) => Some(*status),
            _ => None,
        }
    }

    pub fn cancel(&self) {
        self.op.cancel();
    }
}

impl Drop for MultiQueryStreamHandler {
    fn drop(&mut self) {
        // The operation still owns the connection and may be mid-fetch;
        // it must reach its terminal state before the handle goes away.
        if self.op.inner.base().client.on_reactor_thread() {
            if self.op.state() != OperationState::Completed {
                log::error!(
                    target: "skein::client",
                    "stream handler dropped on the reactor thread with its operation live"
                );
            }
            return;
        }
        self.op.wait();
    }
}
