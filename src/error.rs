use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::key::ConnectionKey;
use crate::protocol::ServerStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Every non-fatal way an operation can end.
///
/// Programming bugs (delivery of a reactor event to an operation in an
/// illegal state, an internal invariant violation in the client) are not
/// represented here; those panic.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The server (or the network) rejected a connection attempt.
    ConnectFailed {
        code: u16,
        message: String,
        key: ConnectionKey,
    },

    /// A query, multi-query, fetch, reset, or change-user failed on the
    /// server after the connection was established.
    Query(QueryFailure),

    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration },

    /// The operation was terminated by an explicit cancel or by client
    /// shutdown.
    Cancelled,

    /// The connection has no protocol handle (it was stolen by an owned
    /// operation or never established).
    InvalidConnection,

    /// An operation is already in progress on this connection.
    OperationInProgress,

    /// A client-side error: malformed input, submission after shutdown
    /// began, a dropped operation.
    Client(Cow<'static, str>),

    /// Options or URL parsing failed.
    Configuration(Cow<'static, str>),
}

impl Error {
    pub(crate) fn client(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Client(message.into())
    }

    pub(crate) fn config(source: impl Display) -> Self {
        Error::Configuration(source.to_string().into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Server error number, when one was reported.
    pub fn server_errno(&self) -> Option<u16> {
        match self {
            Error::ConnectFailed { code, .. } => Some(*code),
            Error::Query(failure) => Some(failure.code),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectFailed { code, message, key } => {
                write!(f, "connect to {} failed: {} ({})", key, message, code)
            }

            Error::Query(failure) => Display::fmt(failure, f),

            Error::Timeout { elapsed } => {
                write!(f, "operation timed out after {:.3?}", elapsed)
            }

            Error::Cancelled => f.write_str("operation was cancelled"),

            Error::InvalidConnection => f.write_str("connection is not usable"),

            Error::OperationInProgress => {
                f.write_str("an operation is already in progress on this connection")
            }

            Error::Client(message) => write!(f, "client error: {}", message),

            Error::Configuration(message) => write!(f, "configuration: {}", message),
        }
    }
}

impl StdError for Error {}

/// Details of a failed query operation, mirrored from the operation at the
/// moment it completed.
#[derive(Debug, Clone)]
pub struct QueryFailure {
    /// Statements that had already executed successfully before the failure.
    pub queries_executed: u32,
    /// Server status flags observed at failure time.
    pub status: ServerStatus,
    /// Server error number.
    pub code: u16,
    /// Server error message.
    pub message: String,
    /// Endpoint of the originating connection.
    pub key: ConnectionKey,
    /// Time from operation start to failure.
    pub elapsed: Duration,
}

impl Display for QueryFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query on {} failed: {} ({}); {} queries executed, elapsed {:.3?}",
            self.key, self.message, self.code, self.queries_executed, self.elapsed
        )
    }
}

impl From<QueryFailure> for Error {
    fn from(failure: QueryFailure) -> Self {
        Error::Query(failure)
    }
}
