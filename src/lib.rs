//! Asynchronous MySQL client core.
//!
//! One dedicated reactor thread drives every protocol operation over
//! nonblocking sockets; callers submit work from any thread and consume
//! results either by blocking or through futures. The wire protocol itself
//! is a collaborator, consumed through the traits in [`protocol`]; this
//! crate is the operation scheduler, connection state machine, and
//! shutdown coordinator on top of it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use skein::{Client, ConnectionKey, ConnectionOptions};
//!
//! # fn driver() -> Arc<dyn skein::ProtocolDriver> { unimplemented!() }
//! let client = Client::new(driver());
//! let key = ConnectionKey::new("localhost", 3306, "test", "u", "p");
//! let mut conn = client.connect(key, ConnectionOptions::new())?;
//! let result = conn.query("SELECT 1")?;
//! assert_eq!(result.rows()[0].as_str(0), Some("1"));
//! client.shutdown();
//! # Ok::<(), skein::Error>(())
//! ```

mod client;
mod connection;
mod error;
mod future;
mod holder;
mod key;
mod logging;
mod operation;
mod options;
mod protocol;
mod query_result;
mod row;
mod socket;
mod stats;
mod stream;

pub mod testing;

pub use client::{Client, ClientBuilder};
pub use connection::{Callbacks, Connection, PostQueryCallback, PreQueryCallback};
pub use error::{Error, QueryFailure, Result};
pub use future::OpFuture;
pub use holder::{ConnectionDyingCallback, ConnectionHolder};
pub use key::ConnectionKey;
pub use logging::{ConnectionLoggingData, DbLogger, QueryLoggingData};
pub use operation::{
    ChangeUserOperation, ConnectOperation, MultiQueryOperation, MultiQueryStreamOperation,
    OperationCallback, OperationReport, OperationState, QueryOperation, ResetOperation,
};
pub use options::{parse_url, ConnectionOptions, QueryOptions, SslMode, SslOptions};
pub use protocol::{
    ClientFlags, Fetched, Flow, Interest, ProtocolDriver, ProtocolHandle, RowCursor, ServerStatus,
};
pub use query_result::{DbMultiQueryResult, DbQueryResult, QueryOutcome, StatementResult};
pub use row::Row;
pub use stats::{DbStats, SimpleDbCounter};
pub use stream::MultiQueryStreamHandler;
