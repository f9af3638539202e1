//! Structured logging collaborator.
//!
//! Distinct from the crate's own `log` diagnostics: a [`DbLogger`] receives
//! one call per terminal operation outcome with enough context to feed an
//! event pipeline. When no logger is installed the calls are skipped.

use std::collections::HashMap;
use std::time::Duration;

use crate::key::ConnectionKey;

/// Context of a finished query-class operation.
#[derive(Debug, Clone)]
pub struct QueryLoggingData {
    /// Operation type name: "query", "multi_query", "reset", ...
    pub operation: &'static str,
    pub num_queries: usize,
    pub elapsed: Duration,
    pub key: ConnectionKey,
    /// Per-query attributes attached to the operation.
    pub attributes: HashMap<String, String>,
}

/// Context of a finished connect operation.
#[derive(Debug, Clone)]
pub struct ConnectionLoggingData {
    pub elapsed: Duration,
    pub key: ConnectionKey,
}

pub trait DbLogger: Send + Sync + 'static {
    fn log_query_success(&self, data: &QueryLoggingData);

    fn log_query_failure(&self, data: &QueryLoggingData, errno: u16, message: &str);

    fn log_connection_success(&self, data: &ConnectionLoggingData);

    fn log_connection_failure(&self, data: &ConnectionLoggingData, errno: u16, message: &str);
}
