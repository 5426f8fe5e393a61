//! Progress reporting and span timing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A shared, monotonically non-decreasing progress fraction in `[0, 1]`.
///
/// The producer calls [`ProgressHandle::advance_to`]; any number of clones
/// may read concurrently. Non-negative `f64` values order the same way as
/// their bit patterns, so the value is kept as raw bits and raised with
/// `fetch_max`.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    bits: Arc<AtomicU64>,
}

impl ProgressHandle {
    /// Creates a handle at 0.0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises progress to `fraction` (clamped). Lower values are ignored.
    pub fn advance_to(&self, fraction: f64) {
        let clamped = if fraction.is_nan() || fraction <= 0.0 { 0.0 } else { fraction.min(1.0) };
        self.bits.fetch_max(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Marks the work as complete.
    pub fn complete(&self) {
        self.advance_to(1.0);
    }

    /// Returns the current fraction.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Returns true once progress reached 1.0.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fraction() >= 1.0
    }
}

/// Wall-clock timer for one operation, logged at debug level when done.
#[derive(Debug)]
pub struct SpanTimer {
    operation: String,
    started: Instant,
}

impl SpanTimer {
    /// Starts timing `operation`.
    #[must_use]
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            started: Instant::now(),
        }
    }

    /// Stops the timer and returns the elapsed milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(operation = %self.operation, elapsed_ms, "Operation timed");
        elapsed_ms
    }
}
