//! Time source abstraction.
//!
//! All internal timestamps are unix milliseconds (`i64`); chrono conversion
//! happens at API and persistence boundaries. Components take the clock from
//! `Services` so sweeps and windows are testable with a manual clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Unix-millisecond timestamp
pub type TimestampMs = i64;

/// Injectable time source
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: TimestampMs) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: TimestampMs) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Render a millisecond timestamp as RFC 3339 for logs and reports
pub fn to_rfc3339(ts_ms: TimestampMs) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{}ms", ts_ms))
}

/// Date component (`YYYY-MM-DD`) of a millisecond timestamp, for backup keys
pub fn to_date(ts_ms: TimestampMs) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}
