//! Time sources
//!
//! Server timestamps are integer milliseconds since the Unix epoch. The
//! coordinator reads them through [`Clock`] so tests can drive time
//! deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Milliseconds since the Unix epoch
pub type TimestampMs = u64;

/// Source of the current time in epoch milliseconds
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> TimestampMs;
}

/// Plain wall clock
///
/// Can step backwards when the system clock is adjusted; prefer
/// [`MonotonicClock`] for anything that stamps a `PlayState`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Wall-anchored monotonic clock
///
/// Reads the wall clock once at construction and advances with the tokio
/// monotonic clock afterwards, so timestamps never go backwards. Under a
/// paused tokio runtime it advances with `tokio::time::advance`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin_ms: TimestampMs,
    start: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now_ms())
    }

    /// Anchor the clock at an explicit epoch time
    pub fn starting_at(origin_ms: TimestampMs) -> Self {
        Self {
            origin_ms,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> TimestampMs {
        self.origin_ms + self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: TimestampMs) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}
