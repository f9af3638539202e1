//! Scriptable in-process protocol driver.
//!
//! Stands in for the native nonblocking MySQL library in tests: connect
//! and query behavior is scripted per host / per SQL string, including
//! forced `Pending` returns. A handle that reports `Pending` writes one
//! byte to the peer end of its socketpair first, so the reactor sees
//! readiness and retries; a `Hang` script pends without the nudge and
//! stays silent forever, which is how timeout and cancellation paths are
//! exercised.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::key::ConnectionKey;
use crate::options::ConnectionOptions;
use crate::protocol::{
    ClientFlags, Fetched, Flow, Interest, ProtocolDriver, ProtocolHandle, RowCursor, ServerStatus,
};
use crate::row::Row;

/// Scripted behavior of connection establishment against one host.
#[derive(Clone)]
pub enum ConnectScript {
    /// Report `Pending` the given number of times, then succeed.
    Succeed { pendings: u32 },
    /// Fail with a server error.
    Fail { code: u16, message: String },
    /// Pend forever without ever becoming ready.
    Hang,
}

/// One scripted result set.
#[derive(Clone, Default)]
pub struct ResultScript {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected: u64,
    pub last_insert_id: u64,
    /// `Pending` returns injected before each fetched row.
    pub pendings: u32,
}

impl ResultScript {
    /// A rowless OK result, as an `UPDATE` would produce.
    pub fn ok(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn rows(columns: &[&str], rows: &[&[&str]]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| Some((*v).to_owned())).collect())
                .collect(),
            ..Self::default()
        }
    }
}

/// Scripted behavior of one SQL string.
#[derive(Clone)]
pub enum QueryScript {
    /// Result sets delivered in order, one per statement.
    Results(Vec<ResultScript>),
    Fail { code: u16, message: String },
    /// Pend forever; the query can only end by timeout or cancellation.
    Hang,
}

#[derive(Default)]
struct MockState {
    connects: Mutex<HashMap<String, ConnectScript>>,
    queries: Mutex<HashMap<String, QueryScript>>,
    resets: AtomicUsize,
    change_users: AtomicUsize,
    handles_opened: AtomicUsize,
}

/// The scriptable driver. Share the `Arc` with the test to adjust scripts
/// and read counters while a client holds the same instance.
#[derive(Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_connect(&self, host: &str, script: ConnectScript) {
        self.state
            .connects
            .lock()
            .insert(host.to_owned(), script);
    }

    pub fn on_query(&self, sql: &str, script: QueryScript) {
        self.state.queries.lock().insert(sql.to_owned(), script);
    }

    /// `COM_RESET_CONNECTION` commands observed across all handles.
    pub fn reset_count(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }

    pub fn change_user_count(&self) -> usize {
        self.state.change_users.load(Ordering::SeqCst)
    }

    pub fn handles_opened(&self) -> usize {
        self.state.handles_opened.load(Ordering::SeqCst)
    }
}

impl ProtocolDriver for MockDriver {
    fn init_handle(
        &self,
        _key: &ConnectionKey,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn ProtocolHandle>> {
        let (sock, peer) = UnixStream::pair()
            .map_err(|e| Error::client(format!("socketpair failed: {}", e)))?;
        sock.set_nonblocking(true)
            .map_err(|e| Error::client(format!("socketpair setup failed: {}", e)))?;
        self.state.handles_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
            sock,
            peer: Arc::new(peer),
            connect_pendings_left: None,
            last_error: None,
            results: VecDeque::new(),
            affected: 0,
            last_insert_id: 0,
            in_transaction: false,
        }))
    }
}

fn nudge(mut peer: &UnixStream) {
    // One byte to the peer makes the handle's socket readable, so the
    // reactor retries the pending step.
    let _ = peer.write_all(&[1]);
}

struct MockHandle {
    state: Arc<MockState>,
    sock: UnixStream,
    peer: Arc<UnixStream>,
    connect_pendings_left: Option<u32>,
    last_error: Option<(u16, String)>,
    results: VecDeque<ResultScript>,
    affected: u64,
    last_insert_id: u64,
    in_transaction: bool,
}

impl ProtocolHandle for MockHandle {
    fn try_connect(
        &mut self,
        _options: &ConnectionOptions,
        key: &ConnectionKey,
        _flags: ClientFlags,
    ) -> Flow {
        let script = self
            .state
            .connects
            .lock()
            .get(&key.host)
            .cloned()
            .unwrap_or(ConnectScript::Succeed { pendings: 0 });

        match script {
            ConnectScript::Hang => Flow::Pending(Interest::Read),
            ConnectScript::Fail { code, message } => {
                self.last_error = Some((code, message));
                Flow::Error
            }
            ConnectScript::Succeed { pendings } => {
                let left = self.connect_pendings_left.get_or_insert(pendings);
                if *left > 0 {
                    *left -= 1;
                    nudge(&self.peer);
                    Flow::Pending(Interest::ReadWrite)
                } else {
                    Flow::Done
                }
            }
        }
    }

    fn run_query(&mut self, sql: &str) -> Flow {
        let trimmed = sql.trim().to_ascii_uppercase();
        if trimmed == "BEGIN" {
            self.in_transaction = true;
        } else if trimmed == "COMMIT" || trimmed == "ROLLBACK" {
            self.in_transaction = false;
        }

        let script = self
            .state
            .queries
            .lock()
            .get(sql)
            .cloned()
            .unwrap_or_else(|| QueryScript::Results(vec![ResultScript::ok(0)]));

        match script {
            QueryScript::Hang => Flow::Pending(Interest::Read),
            QueryScript::Fail { code, message } => {
                self.last_error = Some((code, message));
                Flow::Error
            }
            QueryScript::Results(results) => {
                self.results = results.into();
                Flow::Done
            }
        }
    }

    fn reset(&mut self) -> Flow {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        Flow::Done
    }

    fn change_user(&mut self, _user: &str, _password: &str, _database: &str) -> Flow {
        self.state.change_users.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        Flow::Done
    }

    fn next_result(&mut self) -> Flow {
        Flow::Done
    }

    fn use_result(&mut self) -> Option<Box<dyn RowCursor>> {
        let script = self.results.pop_front()?;
        self.affected = script.affected;
        self.last_insert_id = script.last_insert_id;
        if script.columns.is_empty() {
            return None;
        }

        let columns = Arc::new(script.columns);
        let rows = script
            .rows
            .into_iter()
            .map(|values| {
                Row::new(
                    columns.clone(),
                    values
                        .into_iter()
                        .map(|v| v.map(|s| Bytes::from(s.into_bytes())))
                        .collect(),
                )
            })
            .collect();

        Some(Box::new(MockCursor {
            columns,
            rows,
            pendings_each: script.pendings,
            countdown: script.pendings,
            peer: self.peer.clone(),
        }))
    }

    fn more_results(&self) -> bool {
        !self.results.is_empty()
    }

    fn affected_rows(&self) -> u64 {
        self.affected
    }

    fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    fn error_code(&self) -> u16 {
        self.last_error.as_ref().map(|(code, _)| *code).unwrap_or(0)
    }

    fn error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }

    fn server_status(&self) -> ServerStatus {
        let mut status = ServerStatus::AUTOCOMMIT;
        if self.in_transaction {
            status |= ServerStatus::IN_TRANS;
        }
        status
    }

    fn socket(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

struct MockCursor {
    columns: Arc<Vec<String>>,
    rows: VecDeque<Row>,
    pendings_each: u32,
    countdown: u32,
    peer: Arc<UnixStream>,
}

impl RowCursor for MockCursor {
    fn fetch_row(&mut self) -> Fetched {
        if self.countdown > 0 {
            self.countdown -= 1;
            nudge(&self.peer);
            return Fetched::Pending(Interest::Read);
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.countdown = self.pendings_each;
                Fetched::Row(row)
            }
            None => Fetched::Done,
        }
    }

    fn column_names(&self) -> &[String] {
        &self.columns
    }
}
