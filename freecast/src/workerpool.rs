//! Bounded pool of threads for blocking calls.
//!
//! The scheduler thread never blocks on disk or network I/O directly; it
//! delegates the blocking call to this pool and gets the outcome back as an
//! urgent task on the event loop. Worker threads never touch shared backend
//! state: the only thing they do with a result is marshal it back onto the
//! loop thread.
//!
//! The pool size is fixed. When every worker is busy, additional delegations
//! queue in FIFO order rather than spawning more threads, which bounds
//! resource usage under load spikes (many simultaneous file moves, network
//! identify calls, and the like).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::eventloop::EventLoop;

/// Default number of worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// Returned when work is delegated to a pool that has been closed.
#[derive(Debug, Error)]
#[error("worker pool is closed")]
pub struct PoolClosed;

type WorkItem = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of blocking-call worker threads.
pub struct WorkerPool {
    event_loop: Arc<EventLoop>,
    sender: Mutex<Option<Sender<WorkItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Set on close: queued-but-unstarted work is abandoned.
    closed: Arc<AtomicBool>,
    /// Set on close: result callbacks not yet delivered are skipped.
    suppressed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Creates a pool of `threads` workers feeding results to `event_loop`.
    pub fn new(event_loop: Arc<EventLoop>, threads: usize) -> Self {
        assert!(threads > 0, "worker pool needs at least one thread");

        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let receiver = Arc::new(Mutex::new(receiver));
        let closed = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = Arc::clone(&receiver);
            let closed = Arc::clone(&closed);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || Self::worker_loop(receiver, closed))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        debug!(threads, "worker pool started");

        Self {
            event_loop,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            closed,
            suppressed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<WorkItem>>>, closed: Arc<AtomicBool>) {
        loop {
            let item = {
                let receiver = receiver.lock().unwrap();
                receiver.recv()
            };
            match item {
                Ok(item) => {
                    if closed.load(Ordering::Acquire) {
                        debug!("abandoning queued work item after pool close");
                        continue;
                    }
                    // A panicking work item must not take the worker down;
                    // its callbacks simply never fire.
                    if catch_unwind(AssertUnwindSafe(item)).is_err() {
                        warn!("work item panicked on a worker thread");
                    }
                }
                // Sender dropped: pool is closing and the queue is drained.
                Err(_) => break,
            }
        }
    }

    /// Runs `work` on a worker thread and re-enters the outcome onto the
    /// event loop as an urgent task.
    ///
    /// `on_result`/`on_error` always execute on the loop thread, never on the
    /// worker, preserving the invariant that all state mutation happens on
    /// the scheduler thread. When every worker is busy the request queues in
    /// FIFO order.
    pub fn delegate<T, E>(
        &self,
        label: impl Into<String>,
        work: impl FnOnce() -> Result<T, E> + Send + 'static,
        on_result: impl FnOnce(T) + Send + 'static,
        on_error: impl FnOnce(E) + Send + 'static,
    ) -> Result<(), PoolClosed>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let label = label.into();
        let event_loop = Arc::clone(&self.event_loop);
        let suppressed = Arc::clone(&self.suppressed);

        let item: WorkItem = Box::new(move || {
            let outcome = work();
            let callback_label = format!("{label} (result)");
            event_loop.schedule_urgent(callback_label, move || {
                if suppressed.load(Ordering::Acquire) {
                    debug!(%label, "suppressing result callback after pool close");
                    return;
                }
                match outcome {
                    Ok(value) => on_result(value),
                    Err(error) => on_error(error),
                }
            });
        });

        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => sender.send(item).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// Stops accepting delegations, waits for in-flight calls to finish and
    /// joins every worker thread.
    ///
    /// Queued-but-unstarted work is abandoned. Result callbacks that have not
    /// been delivered by the time close begins are suppressed, so no callback
    /// fires after this returns.
    pub fn close_threads(&self) {
        self.closed.store(true, Ordering::Release);
        self.suppressed.store(true, Ordering::Release);

        // Dropping the sender lets workers drain the queue and exit.
        drop(self.sender.lock().unwrap().take());

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        info!("worker pool closed");
    }

    /// Returns `true` once [`close_threads`](Self::close_threads) has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
