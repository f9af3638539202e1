use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use skein::testing::MockDriver;
use skein::{
    Client, ConnectionKey, ConnectionLoggingData, ConnectionOptions, DbLogger, QueryLoggingData,
    SimpleDbCounter,
};

/// Counts structured-logging calls so tests can assert on terminal
/// outcomes without poking client internals.
#[derive(Default)]
pub struct RecordingLogger {
    connection_successes: AtomicUsize,
    connection_failures: AtomicUsize,
    query_successes: AtomicUsize,
    query_failures: AtomicUsize,
}

impl RecordingLogger {
    pub fn connection_successes(&self) -> usize {
        self.connection_successes.load(Ordering::SeqCst)
    }

    pub fn connection_failures(&self) -> usize {
        self.connection_failures.load(Ordering::SeqCst)
    }

    pub fn query_successes(&self) -> usize {
        self.query_successes.load(Ordering::SeqCst)
    }

    pub fn query_failures(&self) -> usize {
        self.query_failures.load(Ordering::SeqCst)
    }
}

impl DbLogger for RecordingLogger {
    fn log_query_success(&self, _data: &QueryLoggingData) {
        self.query_successes.fetch_add(1, Ordering::SeqCst);
    }

    fn log_query_failure(&self, _data: &QueryLoggingData, _errno: u16, _message: &str) {
        self.query_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn log_connection_success(&self, _data: &ConnectionLoggingData) {
        self.connection_successes.fetch_add(1, Ordering::SeqCst);
    }

    fn log_connection_failure(&self, _data: &ConnectionLoggingData, _errno: u16, _message: &str) {
        self.connection_failures.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub driver: Arc<MockDriver>,
    pub stats: Arc<SimpleDbCounter>,
    pub logger: Arc<RecordingLogger>,
    pub client: Client,
}

pub fn harness() -> Harness {
    let driver = MockDriver::new();
    let stats = Arc::new(SimpleDbCounter::new());
    let logger = Arc::new(RecordingLogger::default());
    let client = Client::builder(driver.clone())
        .stats(stats.clone())
        .db_logger(logger.clone())
        .build();
    Harness {
        driver,
        stats,
        logger,
        client,
    }
}

pub fn test_key() -> ConnectionKey {
    ConnectionKey::new("localhost", 3306, "test", "u", "p")
}

pub fn default_options() -> ConnectionOptions {
    ConnectionOptions::new()
}
