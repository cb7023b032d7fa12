//! Failure isolation at task boundaries.
//!
//! Every callable the scheduler runs goes through a [`FailureTrap`]. A fault
//! inside the callable (a panic caught at the boundary) is converted into a
//! [`FailureReport`] delivered to the registered [`FailureSink`] instead of
//! propagating and killing the loop. Loop shutdown is signalled by a flag,
//! never by unwinding, so anything that reaches the trap is a genuine fault.
//!
//! The trap also tracks wall-clock duration of each call via [`Clock`] and
//! warns when a single call exceeds [`SLOW_CALL_THRESHOLD`]. An opt-in
//! [`TimingLedger`] accumulates per-label totals for diagnostics; it grows
//! with the number of distinct labels and is never consulted for control
//! flow.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock::Clock;

/// A single call longer than this is flagged as slow.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(1);

/// A label whose accumulated time crosses this is flagged as cumulatively slow.
pub const CUMULATIVE_SLOW_THRESHOLD: Duration = Duration::from_secs(5);

// =============================================================================
// Failure reporting
// =============================================================================

/// A trapped failure, ready for presentation by the embedding layer.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Label of the call site that failed ("while processing feed update").
    pub when: String,
    /// Human-readable description of the fault.
    pub message: String,
}

/// Receiver for trapped failures.
///
/// The GUI/logging layer registers one of these to surface crash reports;
/// this core never decides presentation itself.
pub trait FailureSink: Send + Sync {
    /// Called once per trapped failure.
    fn on_failure(&self, report: &FailureReport);
}

/// Failure sink that logs through `tracing`.
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn on_failure(&self, report: &FailureReport) {
        error!(when = %report.when, message = %report.message, "trapped failure");
    }
}

/// Failure sink that discards all reports.
pub struct NullFailureSink;

impl FailureSink for NullFailureSink {
    fn on_failure(&self, _report: &FailureReport) {}
}

// =============================================================================
// Timing ledger
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct LabelTiming {
    total: Duration,
    calls: u64,
    flagged: bool,
}

/// Per-label accumulated call time. Diagnostics only.
#[derive(Debug, Default)]
pub struct TimingLedger {
    totals: HashMap<String, LabelTiming>,
}

impl TimingLedger {
    fn record(&mut self, when: &str, elapsed: Duration) {
        let entry = self.totals.entry(when.to_string()).or_default();
        entry.total += elapsed;
        entry.calls += 1;
        if entry.total > CUMULATIVE_SLOW_THRESHOLD && !entry.flagged {
            entry.flagged = true;
            warn!(
                when,
                total_ms = entry.total.as_millis() as u64,
                calls = entry.calls,
                "call site is cumulatively slow"
            );
        }
    }

    fn log_summary(&self) {
        let mut rows: Vec<_> = self.totals.iter().collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        for (when, timing) in rows {
            info!(
                when = %when,
                total_ms = timing.total.as_millis() as u64,
                calls = timing.calls,
                "call timing"
            );
        }
    }
}

// =============================================================================
// Failure trap
// =============================================================================

/// Wraps units of work, converting faults into reports.
///
/// Cheap to clone; clones share the sink, clock and ledger.
#[derive(Clone)]
pub struct FailureTrap {
    sink: Arc<dyn FailureSink>,
    clock: Arc<Clock>,
    slow_threshold: Duration,
    ledger: Option<Arc<Mutex<TimingLedger>>>,
}

impl FailureTrap {
    /// Creates a trap reporting to the given sink.
    pub fn new(sink: Arc<dyn FailureSink>, clock: Arc<Clock>) -> Self {
        Self {
            sink,
            clock,
            slow_threshold: SLOW_CALL_THRESHOLD,
            ledger: None,
        }
    }

    /// Overrides the single-call slow threshold.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Enables the per-label timing ledger.
    pub fn with_timing_ledger(mut self) -> Self {
        self.ledger = Some(Arc::new(Mutex::new(TimingLedger::default())));
        self
    }

    /// Returns the failure sink shared by this trap.
    pub fn sink(&self) -> Arc<dyn FailureSink> {
        Arc::clone(&self.sink)
    }

    /// Runs `f`, trapping any fault. Returns `true` when `f` completed.
    pub fn run(&self, when: &str, f: impl FnOnce()) -> bool {
        self.run_with_result(when, f).is_some()
    }

    /// Runs `f`, trapping any fault, and returns its value on success.
    pub fn run_with_result<T>(&self, when: &str, f: impl FnOnce() -> T) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.report(when, panic_message(payload.as_ref()));
                None
            }
        }
    }

    /// Like [`run`](Self::run), additionally measuring wall-clock duration.
    ///
    /// Warns when the call exceeds the slow threshold and, if the ledger is
    /// enabled, accumulates the per-label total.
    pub fn run_timed(&self, when: &str, f: impl FnOnce()) -> bool {
        let started = self.clock.now();
        let ok = self.run(when, f);
        let elapsed = self.clock.now().saturating_sub(started);

        if elapsed > self.slow_threshold {
            warn!(when, elapsed_ms = elapsed.as_millis() as u64, "slow call");
        }
        if let Some(ledger) = &self.ledger {
            ledger.lock().unwrap().record(when, elapsed);
        }
        ok
    }

    /// Reports a failure that was detected outside a trapped call.
    pub fn report(&self, when: &str, message: String) {
        let report = FailureReport {
            when: when.to_string(),
            message,
        };
        self.sink.on_failure(&report);
    }

    /// Dumps the timing ledger, if enabled, through `tracing`.
    pub fn log_summary(&self) {
        if let Some(ledger) = &self.ledger {
            ledger.lock().unwrap().log_summary();
        }
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that collects reports for assertions.
    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<FailureReport>>,
    }

    impl FailureSink for CollectingSink {
        fn on_failure(&self, report: &FailureReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    fn trap_with_sink() -> (FailureTrap, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let trap = FailureTrap::new(
            Arc::clone(&sink) as Arc<dyn FailureSink>,
            Arc::new(Clock::new()),
        );
        (trap, sink)
    }

    #[test]
    fn successful_call_returns_true() {
        let (trap, sink) = trap_with_sink();
        assert!(trap.run("noop", || {}));
        assert!(sink.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn panic_is_trapped_and_reported() {
        let (trap, sink) = trap_with_sink();
        let ok = trap.run("exploding task", || panic!("boom"));
        assert!(!ok);

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].when, "exploding task");
        assert!(reports[0].message.contains("boom"));
    }

    #[test]
    fn run_with_result_yields_value() {
        let (trap, _sink) = trap_with_sink();
        assert_eq!(trap.run_with_result("compute", || 41 + 1), Some(42));
        assert_eq!(trap.run_with_result::<i32>("fail", || panic!("no")), None);
    }

    #[test]
    fn timed_run_records_ledger() {
        let sink = Arc::new(CollectingSink::default());
        let trap = FailureTrap::new(
            Arc::clone(&sink) as Arc<dyn FailureSink>,
            Arc::new(Clock::new()),
        )
        .with_timing_ledger();

        assert!(trap.run_timed("quick", || {}));
        let ledger = trap.ledger.as_ref().unwrap().lock().unwrap();
        assert_eq!(ledger.totals.get("quick").unwrap().calls, 1);
    }

    #[test]
    fn string_panic_payloads_are_extracted() {
        let (trap, sink) = trap_with_sink();
        trap.run("owned", || panic!("{}", String::from("owned message")));
        let reports = sink.reports.lock().unwrap();
        assert!(reports[0].message.contains("owned message"));
    }
}
