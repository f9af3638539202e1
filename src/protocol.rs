//! Interface to the nonblocking MySQL protocol library.
//!
//! The client core never speaks the wire protocol itself. It drives an
//! external implementation of [`ProtocolDriver`] / [`ProtocolHandle`]
//! through tri-valued nonblocking steps, reacting to socket readiness in
//! between. The scriptable implementation used by this crate's own tests
//! lives in [`crate::testing`].

use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::error::Result;
use crate::key::ConnectionKey;
use crate::options::ConnectionOptions;
use crate::row::Row;

/// Status of one nonblocking protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The step would block; retry it when the socket reaches the given
    /// readiness.
    Pending(Interest),
    /// The step finished.
    Done,
    /// The step failed; the error number and message are readable from the
    /// handle.
    Error,
}

/// Socket readiness a pending step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

/// Outcome of one nonblocking row fetch.
///
/// There is no error arm: by contract a fetch cannot fail once the result
/// cursor exists, and an implementation that observes one anyway has hit a
/// protocol-library bug and must panic.
#[derive(Debug)]
pub enum Fetched {
    /// The fetch would block.
    Pending(Interest),
    /// One row was produced.
    Row(Row),
    /// The current result set is exhausted.
    Done,
}

bitflags! {
    /// Capability flags sent at connect time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const FOUND_ROWS       = 0x0000_0002;
        const COMPRESS         = 0x0000_0020;
        const LOCAL_FILES      = 0x0000_0080;
        const SSL              = 0x0000_0800;
        const MULTI_STATEMENTS = 0x0001_0000;
        const MULTI_RESULTS    = 0x0002_0000;
    }
}

bitflags! {
    /// Server status flags reported after each command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerStatus: u16 {
        const IN_TRANS             = 0x0001;
        const AUTOCOMMIT           = 0x0002;
        const MORE_RESULTS_EXISTS  = 0x0008;
        const NO_GOOD_INDEX_USED   = 0x0010;
        const NO_INDEX_USED        = 0x0020;
        const CURSOR_EXISTS        = 0x0040;
        const LAST_ROW_SENT        = 0x0080;
        const SESSION_STATE_CHANGED = 0x4000;
    }
}

/// Factory for protocol handles, plus process-wide library setup.
pub trait ProtocolDriver: Send + Sync + 'static {
    /// One-time process-wide initialization. SSL setup must happen before
    /// library setup. Called exactly once, on first client construction.
    fn global_init(&self) {}

    /// Allocate an unconnected handle for the given endpoint.
    fn init_handle(
        &self,
        key: &ConnectionKey,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn ProtocolHandle>>;
}

/// One native protocol handle in the nonblocking API.
///
/// Every method here is nonblocking; the tri-valued [`Flow`] statuses are
/// the only way a step reports progress. Accessors (`error_code`,
/// `server_status`, ...) are synchronous reads of handle state.
pub trait ProtocolHandle: Send {
    /// Start or continue connection establishment.
    fn try_connect(
        &mut self,
        options: &ConnectionOptions,
        key: &ConnectionKey,
        flags: ClientFlags,
    ) -> Flow;

    /// Start or continue sending a query string.
    fn run_query(&mut self, sql: &str) -> Flow;

    /// Start or continue `COM_RESET_CONNECTION`.
    fn reset(&mut self) -> Flow;

    /// Start or continue `COM_CHANGE_USER`.
    fn change_user(&mut self, user: &str, password: &str, database: &str) -> Flow;

    /// Advance to the next result set of a multi-statement query.
    fn next_result(&mut self) -> Flow;

    /// Obtain a cursor over the current result set, or `None` when the
    /// statement produced no row data (e.g. an `UPDATE`).
    fn use_result(&mut self) -> Option<Box<dyn RowCursor>>;

    /// Whether another result set follows the current one.
    fn more_results(&self) -> bool;

    fn affected_rows(&self) -> u64;

    fn last_insert_id(&self) -> u64;

    /// Error number of the last failed step.
    fn error_code(&self) -> u16;

    /// Error message of the last failed step.
    fn error_message(&self) -> String;

    fn server_status(&self) -> ServerStatus;

    fn in_transaction(&self) -> bool {
        self.server_status().contains(ServerStatus::IN_TRANS)
    }

    /// Descriptor the reactor registers for readiness. Valid from the first
    /// pending connect step onward.
    fn socket(&self) -> RawFd;
}

/// Pull cursor over one in-progress result set.
pub trait RowCursor: Send {
    /// Fetch the next row without blocking.
    fn fetch_row(&mut self) -> Fetched;

    fn column_names(&self) -> &[String];
}
