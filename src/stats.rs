//! Run statistics.
//!
//! Outcome counters are atomics so the progress display can read them
//! while cases run.

use crate::traits::{CaseReport, Outcome};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe tally of case outcomes.
pub struct RunStats {
    passed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    elapsed_ms: AtomicU64,
}

impl RunStats {
    /// Creates a new RunStats instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            passed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            elapsed_ms: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Pass => &self.passed,
            Outcome::Skip { .. } => &self.skipped,
            Outcome::Fail { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished case including its wall time.
    pub fn record_report(&self, report: &CaseReport) {
        self.record(&report.outcome);
        self.elapsed_ms
            .fetch_add(report.duration_ms, Ordering::Relaxed);
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Total number of cases recorded.
    pub fn total(&self) -> u64 {
        self.passed() + self.skipped() + self.failed()
    }

    /// Summed wall time of recorded cases in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Relaxed)
    }

    /// One-line summary, e.g. `10 passed, 2 skipped, 0 failed`.
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} skipped, {} failed",
            self.passed(),
            self.skipped(),
            self.failed()
        )
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}
