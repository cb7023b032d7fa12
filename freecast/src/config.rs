//! Settings structs for the concurrency core.
//!
//! Pure data types with defaults and builder-style setters; no parsing
//! logic. Each component takes the section it cares about.

use std::time::Duration;

use crate::trap::SLOW_CALL_THRESHOLD;
use crate::workerpool::DEFAULT_WORKER_THREADS;

/// Default ceiling on attempts for a retried synchronous call.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

/// Default backoff before the first resend.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Backoff never grows past this.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Default cap on nested synchronous calls from the loop thread.
pub const DEFAULT_MAX_NESTED_CALLS: usize = 8;

/// Configuration for one process's [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of blocking-call worker threads.
    pub worker_threads: usize,
    /// Single calls longer than this are flagged as slow.
    pub slow_call_threshold: Duration,
    /// Enables the per-label call-timing ledger (diagnostics only).
    pub timing_ledger: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            slow_call_threshold: SLOW_CALL_THRESHOLD,
            timing_ledger: false,
        }
    }
}

impl RuntimeConfig {
    /// Sets the worker-thread count.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the slow-call threshold.
    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold = threshold;
        self
    }

    /// Enables the call-timing ledger.
    pub fn with_timing_ledger(mut self) -> Self {
        self.timing_ledger = true;
        self
    }
}

/// Retry and nesting policy for the RPC layer.
#[derive(Debug, Clone)]
pub struct RpcSettings {
    /// Total attempts for a call made with retry (first try included).
    pub max_attempts: u32,
    /// Backoff before the first resend; doubles per attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the doubling backoff.
    pub backoff_cap: Duration,
    /// Chained synchronous calls beyond this depth fail fast instead of
    /// recursing further into the scheduler.
    pub max_nested_calls: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            max_nested_calls: DEFAULT_MAX_NESTED_CALLS,
        }
    }
}

impl RpcSettings {
    /// Sets the attempt ceiling for retried calls.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial resend backoff.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the backoff cap.
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Sets the nested synchronous-call cap.
    pub fn with_max_nested_calls(mut self, cap: usize) -> Self {
        self.max_nested_calls = cap;
        self
    }
}
