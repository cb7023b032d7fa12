//! Per-process context object.
//!
//! One [`Runtime`] is constructed at process startup and handed to every
//! component that needs the clock, the event loop or the worker pool. Tests
//! build a fresh runtime each; nothing in this crate lives in module-level
//! mutable state.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::eventloop::EventLoop;
use crate::trap::{FailureSink, FailureTrap, TracingFailureSink};
use crate::workerpool::WorkerPool;

/// The concurrency core of one process: clock, loop and worker pool.
pub struct Runtime {
    clock: Arc<Clock>,
    event_loop: Arc<EventLoop>,
    pool: Arc<WorkerPool>,
}

impl Runtime {
    /// Builds a runtime reporting failures through `tracing`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingFailureSink))
    }

    /// Builds a runtime with a custom failure sink (the GUI layer's crash
    /// reporter, a collecting sink in tests).
    pub fn with_sink(config: RuntimeConfig, sink: Arc<dyn FailureSink>) -> Self {
        let clock = Arc::new(Clock::new());
        let mut trap = FailureTrap::new(sink, Arc::clone(&clock))
            .with_slow_threshold(config.slow_call_threshold);
        if config.timing_ledger {
            trap = trap.with_timing_ledger();
        }

        let event_loop = EventLoop::new(trap, Arc::clone(&clock));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&event_loop),
            config.worker_threads,
        ));

        Self {
            clock,
            event_loop,
            pool,
        }
    }

    /// The process-wide monotonic clock.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The scheduler owning this process's backend control flow.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The blocking-call worker pool.
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs the event loop on the calling thread until quit.
    pub fn run(&self) {
        self.event_loop.run();
    }

    /// Stops the loop and tears the worker pool down.
    ///
    /// Call after [`run`](Self::run) has returned, or from any thread other
    /// than the loop thread.
    pub fn shutdown(&self) {
        self.event_loop.quit();
        self.pool.close_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn runtime_wires_loop_and_pool_together() {
        let runtime = Runtime::new(RuntimeConfig::default().with_worker_threads(2));
        let event_loop = Arc::clone(runtime.event_loop());
        let loop_thread = thread::spawn(move || event_loop.run());

        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        runtime
            .worker_pool()
            .delegate(
                "probe",
                || Ok::<_, String>(()),
                move |_| done2.store(true, Ordering::SeqCst),
                |_| {},
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(done.load(Ordering::SeqCst));

        runtime.shutdown();
        loop_thread.join().unwrap();
    }
}
