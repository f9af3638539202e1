//! Statistics collaborator.
//!
//! The core forwards one call per control point and never aggregates; the
//! implementation decides what to keep. [`SimpleDbCounter`] is the default
//! in-process implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

pub trait DbStats: Send + Sync + 'static {
    fn incr_succeeded_queries(&self);

    fn incr_failed_queries(&self, errno: u16);

    fn incr_failed_connections(&self, errno: u16);

    /// One sample of reactor scheduling latency: time between enqueueing a
    /// closure for the reactor and the reactor starting to run it.
    fn callback_delay_sample(&self, delay: Duration);
}

/// Plain atomic counters plus an exponential moving average of callback
/// delay.
#[derive(Default)]
pub struct SimpleDbCounter {
    succeeded_queries: AtomicU64,
    failed_queries: AtomicU64,
    failed_connections: AtomicU64,
    callback_delay_avg: ExpMovingAverage,
}

impl SimpleDbCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded_queries(&self) -> u64 {
        self.succeeded_queries.load(Ordering::Relaxed)
    }

    pub fn failed_queries(&self) -> u64 {
        self.failed_queries.load(Ordering::Relaxed)
    }

    pub fn failed_connections(&self) -> u64 {
        self.failed_connections.load(Ordering::Relaxed)
    }

    pub fn callback_delay_avg(&self) -> Duration {
        self.callback_delay_avg.value()
    }
}

impl DbStats for SimpleDbCounter {
    fn incr_succeeded_queries(&self) {
        self.succeeded_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_failed_queries(&self, _errno: u16) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_failed_connections(&self, _errno: u16) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn callback_delay_sample(&self, delay: Duration) {
        self.callback_delay_avg.add_sample(delay.as_micros() as f64);
    }
}

/// EMA over microsecond samples, smoothing factor 1/16.
#[derive(Default)]
struct ExpMovingAverage {
    state: Mutex<Option<f64>>,
}

impl ExpMovingAverage {
    const FACTOR: f64 = 1.0 / 16.0;

    fn add_sample(&self, sample: f64) {
        let mut state = self.state.lock();
        *state = Some(match *state {
            None => sample,
            Some(avg) => avg + (sample - avg) * Self::FACTOR,
        });
    }

    fn value(&self) -> Duration {
        let micros = self.state.lock().unwrap_or(0.0);
        Duration::from_micros(micros as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_independently() {
        let stats = SimpleDbCounter::new();
        stats.incr_succeeded_queries();
        stats.incr_succeeded_queries();
        stats.incr_failed_queries(1064);
        stats.incr_failed_connections(2003);

        assert_eq!(stats.succeeded_queries(), 2);
        assert_eq!(stats.failed_queries(), 1);
        assert_eq!(stats.failed_connections(), 1);
    }

    #[test]
    fn first_sample_seeds_the_average() {
        let stats = SimpleDbCounter::new();
        stats.callback_delay_sample(Duration::from_micros(800));

        assert_eq!(stats.callback_delay_avg(), Duration::from_micros(800));
    }
}
