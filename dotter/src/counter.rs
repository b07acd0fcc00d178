//! The emitted line counter.
//!
//! ## Metrics
//!
//! `cron_log_total`: Lines emitted since start or since the last reset
//!

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use metrics::{Gauge, gauge};

/// Name under which the counter is exported.
pub const METRIC_NAME: &str = "cron_log_total";

/// Process-wide count of emitted log lines.
///
/// The count only moves forward except through [`LineCounter::reset`]. It is
/// exported as a gauge rather than a counter because a reset must be visible
/// to scrapers as a drop to zero.
pub struct LineCounter {
    total: AtomicU64,
    gauge: Gauge,
}

impl LineCounter {
    /// Create a new [`LineCounter`] at zero.
    ///
    /// The metric handle is resolved here, so construct the counter after the
    /// metrics recorder is installed.
    #[must_use]
    pub fn new() -> Self {
        let gauge = gauge!(METRIC_NAME);
        gauge.set(0.0);
        Self {
            total: AtomicU64::new(0),
            gauge,
        }
    }

    /// Add `lines` to the count, returning the new total.
    pub fn add(&self, lines: u64) -> u64 {
        let total = self.total.fetch_add(lines, Ordering::AcqRel) + lines;
        self.gauge.set(total as f64);
        total
    }

    /// Set the count back to zero.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Release);
        self.gauge.set(0.0);
    }

    /// The current count.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

impl Default for LineCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LineCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineCounter")
            .field("total", &self.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::LineCounter;

    #[test]
    fn add_accumulates_and_reset_zeroes() {
        let counter = LineCounter::new();
        assert_eq!(counter.add(10), 10);
        assert_eq!(counter.add(5), 15);
        assert_eq!(counter.get(), 15);

        counter.reset();
        assert_eq!(counter.get(), 0);
        assert_eq!(counter.add(3), 3);
    }
}
