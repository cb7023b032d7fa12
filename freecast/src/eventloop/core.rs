//! The cooperative scheduler run loop.
//!
//! One [`EventLoop`] owns the backend process's control flow. Each pass:
//!
//! 1. drains the *urgent* queue completely,
//! 2. fires every timeout whose deadline has arrived,
//! 3. runs exactly one *idle* task,
//!
//! then parks until the next timeout deadline or until another thread
//! schedules work. Every callable executes through the loop's [`FailureTrap`],
//! so a fault in one task never takes the loop down. All structural locks are
//! released before a callable runs; a task is free to schedule more tasks.
//!
//! Scheduling entry points are safe from any thread; execution is confined to
//! the single loop thread and asserted via [`ThreadGuard`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::guard::ThreadGuard;
use super::task::{Task, TaskQueue};
use super::timeout::{TimeoutHandle, TimeoutHeap};
use crate::clock::Clock;
use crate::trap::FailureTrap;

/// Result of one idle-iteration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterateStep {
    /// More work remains; the step will be scheduled again.
    More,
    /// The iteration is finished.
    Done,
}

/// Snapshot of loop activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopStats {
    /// Urgent tasks executed.
    pub urgent_run: u64,
    /// Idle tasks executed.
    pub idle_run: u64,
    /// Timeout callables fired.
    pub timeouts_fired: u64,
    /// Tasks discarded when the loop quit.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    urgent_run: AtomicU64,
    idle_run: AtomicU64,
    timeouts_fired: AtomicU64,
    discarded: AtomicU64,
}

struct ParkState {
    wake_pending: bool,
}

/// The single cooperative scheduler for a backend process.
pub struct EventLoop {
    urgent: TaskQueue,
    idle: TaskQueue,
    timeouts: Mutex<TimeoutHeap>,
    park_state: Mutex<ParkState>,
    wake: Condvar,
    guard: ThreadGuard,
    trap: FailureTrap,
    clock: Arc<Clock>,
    quitting: AtomicBool,
    nested: AtomicUsize,
    counters: Counters,
}

impl EventLoop {
    /// Creates a loop that runs callables through the given trap.
    pub fn new(trap: FailureTrap, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self {
            urgent: TaskQueue::new(),
            idle: TaskQueue::new(),
            timeouts: Mutex::new(TimeoutHeap::new()),
            park_state: Mutex::new(ParkState {
                wake_pending: false,
            }),
            wake: Condvar::new(),
            guard: ThreadGuard::new(),
            trap,
            clock,
            quitting: AtomicBool::new(false),
            nested: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    /// The clock timeouts are ordered by.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The thread-confinement guard for this loop.
    pub fn guard(&self) -> &ThreadGuard {
        &self.guard
    }

    /// The failure trap callables run through.
    pub fn trap(&self) -> &FailureTrap {
        &self.trap
    }

    // =========================================================================
    // Scheduling (safe from any thread)
    // =========================================================================

    /// Schedules a task that runs before any idle work.
    pub fn schedule_urgent(&self, label: impl Into<String>, f: impl FnOnce() + Send + 'static) {
        self.urgent.push(Task::new(label, f));
        self.wakeup();
    }

    /// Schedules a low-priority task; one idle task runs per pass.
    pub fn schedule_idle(&self, label: impl Into<String>, f: impl FnOnce() + Send + 'static) {
        self.idle.push(Task::new(label, f));
        self.wakeup();
    }

    /// Runs a resumable step function one idle slice at a time.
    ///
    /// Each pass invokes `step` once; [`IterateStep::More`] re-enqueues it,
    /// [`IterateStep::Done`] ends the iteration. This is the loop's only
    /// mechanism for long-running but non-blocking work: progress is
    /// guaranteed without ever monopolizing a pass.
    pub fn schedule_idle_iterate(
        self: &Arc<Self>,
        label: impl Into<String>,
        mut step: impl FnMut() -> IterateStep + Send + 'static,
    ) {
        let label = label.into();
        let event_loop = Arc::clone(self);
        self.schedule_idle(label.clone(), move || {
            if step() == IterateStep::More {
                event_loop.schedule_idle_iterate(label, step);
            }
        });
    }

    /// Schedules `f` to run once, `delay` from now. Returns a cancel handle.
    pub fn add_timeout(
        &self,
        delay: Duration,
        label: impl Into<String>,
        f: impl FnOnce() + Send + 'static,
    ) -> TimeoutHandle {
        let mut f = Some(f);
        let callable = Box::new(move || {
            if let Some(f) = f.take() {
                f();
            }
        });
        self.insert_timeout(delay, None, label, callable)
    }

    /// Schedules `f` to run every `interval`, starting one interval from now.
    ///
    /// Each repeat is scheduled off the previous *scheduled* fire time, not
    /// off "now", so the period never creeps under load.
    pub fn add_repeating_timeout(
        &self,
        interval: Duration,
        label: impl Into<String>,
        f: impl FnMut() + Send + 'static,
    ) -> TimeoutHandle {
        self.insert_timeout(interval, Some(interval), label, Box::new(f))
    }

    fn insert_timeout(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        label: impl Into<String>,
        callable: Box<dyn FnMut() + Send>,
    ) -> TimeoutHandle {
        let fire_at = self.clock.now() + delay;
        let handle = self
            .timeouts
            .lock()
            .unwrap()
            .insert(fire_at, interval, label, callable);
        // The new deadline may be earlier than the one the loop is parked on.
        self.wakeup();
        handle
    }

    /// Wakes the loop if it is parked waiting for a deadline.
    pub fn wakeup(&self) {
        let mut state = self.park_state.lock().unwrap();
        state.wake_pending = true;
        self.wake.notify_all();
    }

    /// Stops the loop. Idempotent and safe from any thread.
    ///
    /// Tasks still queued when the loop exits are discarded; the discard
    /// count is logged and surfaced in [`LoopStats`].
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::Release);
        self.wakeup();
    }

    /// Returns `true` once [`quit`](Self::quit) has been called.
    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    // =========================================================================
    // Running (loop thread only)
    // =========================================================================

    /// Runs the loop on the calling thread until [`quit`](Self::quit).
    pub fn run(&self) {
        self.guard.register_loop_thread();
        info!("event loop running");

        while !self.is_quitting() {
            self.run_once();
            if self.is_quitting() {
                break;
            }
            if !self.has_ready_work() {
                self.park(None);
            }
        }

        let discarded = (self.urgent.clear() + self.idle.clear()) as u64;
        self.counters.discarded.store(discarded, Ordering::Relaxed);
        let stats = self.stats();
        info!(
            urgent_run = stats.urgent_run,
            idle_run = stats.idle_run,
            timeouts_fired = stats.timeouts_fired,
            discarded = stats.discarded,
            "event loop stopped"
        );
        self.trap.log_summary();
    }

    /// Executes one scheduler pass. Returns `true` if anything ran.
    pub(crate) fn run_once(&self) -> bool {
        self.guard.assert_loop_thread("EventLoop::run_once");
        let mut did_work = false;

        // 1. Urgent tasks drain completely, in FIFO order.
        while let Some(task) = self.urgent.pop() {
            self.counters.urgent_run.fetch_add(1, Ordering::Relaxed);
            self.trap.run_timed(&task.label, task.callable);
            did_work = true;
            if self.is_quitting() {
                return did_work;
            }
        }

        // 2. Every due timeout fires; repeats advance off the scheduled time.
        let now = self.clock.now();
        loop {
            let due = self.timeouts.lock().unwrap().pop_due(now);
            let Some(mut entry) = due else { break };
            // Re-check immediately before invocation: a cancel that raced
            // with the pop must still win.
            if entry.state.is_cancelled() {
                continue;
            }
            self.counters.timeouts_fired.fetch_add(1, Ordering::Relaxed);
            let label = entry.state.label().to_string();
            self.trap.run_timed(&label, || (entry.callable)());
            did_work = true;

            if let Some(interval) = entry.interval {
                if !entry.state.is_cancelled() {
                    entry.fire_at += interval;
                    self.timeouts.lock().unwrap().reinsert(entry);
                }
            }
            if self.is_quitting() {
                return did_work;
            }
        }

        // 3. Exactly one idle slice per pass bounds the latency idle work
        //    injects into urgent processing.
        if let Some(task) = self.idle.pop() {
            self.counters.idle_run.fetch_add(1, Ordering::Relaxed);
            self.trap.run_timed(&task.label, task.callable);
            did_work = true;
        }

        did_work
    }

    /// Runs nested scheduler passes until `done` returns `true`.
    ///
    /// This is the mechanism behind synchronous RPC sends on the loop thread:
    /// urgent tasks and due timeouts keep being processed while the caller
    /// waits. Returns `false` if the loop quit or `timeout` elapsed first.
    pub(crate) fn pump_until(
        &self,
        timeout: Option<Duration>,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        self.guard.assert_loop_thread("EventLoop::pump_until");
        self.nested.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| self.clock.now() + t);

        let satisfied = loop {
            if done() {
                break true;
            }
            if self.is_quitting() {
                break false;
            }
            if let Some(deadline) = deadline {
                if self.clock.now() >= deadline {
                    break false;
                }
            }
            self.run_once();
            if done() || self.is_quitting() {
                continue;
            }
            if !self.has_ready_work() {
                self.park(deadline);
            }
        };

        self.nested.fetch_sub(1, Ordering::SeqCst);
        satisfied
    }

    /// Current depth of nested [`pump_until`](Self::pump_until) calls.
    pub(crate) fn nested_depth(&self) -> usize {
        self.nested.load(Ordering::SeqCst)
    }

    /// Returns the loop's activity counters.
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            urgent_run: self.counters.urgent_run.load(Ordering::Relaxed),
            idle_run: self.counters.idle_run.load(Ordering::Relaxed),
            timeouts_fired: self.counters.timeouts_fired.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    fn has_ready_work(&self) -> bool {
        if !self.urgent.is_empty() || !self.idle.is_empty() {
            return true;
        }
        let timeouts = self.timeouts.lock().unwrap();
        timeouts
            .next_deadline()
            .is_some_and(|deadline| deadline <= self.clock.now())
    }

    /// Parks until woken, the next timeout deadline, or `limit`.
    fn park(&self, limit: Option<Duration>) {
        let (timeout_deadline, timeouts_pending) = {
            let timeouts = self.timeouts.lock().unwrap();
            (timeouts.next_deadline(), timeouts.len())
        };
        let deadline = match (timeout_deadline, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut state = self.park_state.lock().unwrap();
        if state.wake_pending {
            state.wake_pending = false;
            return;
        }

        debug!(
            idle_pending = self.idle.len(),
            timeouts_pending, "parking"
        );

        match deadline {
            Some(deadline) => {
                let now = self.clock.now();
                if deadline > now {
                    let (guard, _) = self
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
            None => {
                state = self.wake.wait(state).unwrap();
            }
        }
        state.wake_pending = false;
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("urgent_pending", &self.urgent.len())
            .field("idle_pending", &self.idle.len())
            .field("quitting", &self.is_quitting())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::NullFailureSink;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn test_loop() -> Arc<EventLoop> {
        let clock = Arc::new(Clock::new());
        let trap = FailureTrap::new(Arc::new(NullFailureSink), Arc::clone(&clock));
        EventLoop::new(trap, clock)
    }

    /// Runs the loop on a helper thread, returning a join guard.
    fn spawn_loop(event_loop: &Arc<EventLoop>) -> thread::JoinHandle<()> {
        let event_loop = Arc::clone(event_loop);
        thread::Builder::new()
            .name("test-loop".into())
            .spawn(move || event_loop.run())
            .unwrap()
    }

    #[test]
    fn urgent_runs_before_idle() {
        let event_loop = test_loop();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            event_loop.schedule_idle(format!("idle-{i}"), move || {
                order.lock().unwrap().push(format!("idle-{i}"));
            });
        }
        for i in 0..3 {
            let order = Arc::clone(&order);
            event_loop.schedule_urgent(format!("urgent-{i}"), move || {
                order.lock().unwrap().push(format!("urgent-{i}"));
            });
        }

        let quitter = Arc::clone(&event_loop);
        event_loop.schedule_idle("quit", move || quitter.quit());

        let handle = spawn_loop(&event_loop);
        handle.join().unwrap();

        let order = order.lock().unwrap();
        let urgent_positions: Vec<_> = (0..3)
            .map(|i| {
                order
                    .iter()
                    .position(|s| s == &format!("urgent-{i}"))
                    .unwrap()
            })
            .collect();
        let idle_positions: Vec<_> = (0..3)
            .map(|i| order.iter().position(|s| s == &format!("idle-{i}")).unwrap())
            .collect();

        // Every urgent task from the wave runs before every idle task.
        assert!(urgent_positions.iter().max() < idle_positions.iter().min());
        // Both bands keep FIFO order internally.
        assert!(urgent_positions.windows(2).all(|w| w[0] < w[1]));
        assert!(idle_positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn one_shot_timeout_fires_once() {
        let event_loop = test_loop();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        event_loop.add_timeout(Duration::from_millis(10), "once", move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let quitter = Arc::clone(&event_loop);
        event_loop.add_timeout(Duration::from_millis(60), "quit", move || quitter.quit());

        let handle = spawn_loop(&event_loop);
        handle.join().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timeout_never_fires() {
        let event_loop = test_loop();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let handle = event_loop.add_timeout(Duration::from_millis(20), "cancelled", move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        let quitter = Arc::clone(&event_loop);
        event_loop.add_timeout(Duration::from_millis(50), "quit", move || quitter.quit());

        spawn_loop(&event_loop).join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_timeout_keeps_schedule() {
        let event_loop = test_loop();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let ticker =
            event_loop.add_repeating_timeout(Duration::from_millis(10), "tick", move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });

        let quitter = Arc::clone(&event_loop);
        let ticker2 = ticker.clone();
        event_loop.add_timeout(Duration::from_millis(55), "stop", move || {
            ticker2.cancel();
            quitter.quit();
        });

        spawn_loop(&event_loop).join().unwrap();

        // Five intervals fit in 55ms; allow scheduling slack on either side.
        let count = fired.load(Ordering::SeqCst);
        assert!((4..=6).contains(&count), "expected ~5 fires, got {count}");
    }

    #[test]
    fn idle_iterate_runs_to_completion() {
        let event_loop = test_loop();
        let steps = Arc::new(AtomicUsize::new(0));

        let steps2 = Arc::clone(&steps);
        let quitter = Arc::clone(&event_loop);
        event_loop.schedule_idle_iterate("countdown", move || {
            let done = steps2.fetch_add(1, Ordering::SeqCst) == 9;
            if done {
                quitter.quit();
                IterateStep::Done
            } else {
                IterateStep::More
            }
        });

        spawn_loop(&event_loop).join().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn task_panic_does_not_stop_the_loop() {
        let event_loop = test_loop();
        let survived = Arc::new(AtomicUsize::new(0));

        event_loop.schedule_urgent("exploding", || panic!("task fault"));
        let survived2 = Arc::clone(&survived);
        let quitter = Arc::clone(&event_loop);
        event_loop.schedule_urgent("survivor", move || {
            survived2.fetch_add(1, Ordering::SeqCst);
            quitter.quit();
        });

        spawn_loop(&event_loop).join().unwrap();
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_from_another_thread_unparks() {
        let event_loop = test_loop();
        let handle = spawn_loop(&event_loop);

        // Give the loop time to park with nothing scheduled.
        thread::sleep(Duration::from_millis(30));
        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn quit_discards_queued_tasks() {
        let event_loop = test_loop();
        let ran = Arc::new(AtomicUsize::new(0));

        let quitter = Arc::clone(&event_loop);
        event_loop.schedule_urgent("quit-first", move || quitter.quit());
        let ran2 = Arc::clone(&ran);
        event_loop.schedule_urgent("never-runs", move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        spawn_loop(&event_loop).join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.stats().discarded, 1);
    }
}
