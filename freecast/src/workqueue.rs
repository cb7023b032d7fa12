//! Fixed-concurrency job admission queue.
//!
//! Some background work - media-metadata extraction is the canonical case -
//! is cheap to request and expensive to run. The [`BoundedWorkQueue`] caps
//! how many such jobs run at once: excess requests queue in submission order
//! and are promoted as slots free up. Admission is idempotent per subject
//! key, so a flood of requests for the same item runs it once.
//!
//! Job bodies run on the worker pool; all queue state transitions happen on
//! the event loop thread, where completion callbacks are delivered.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::eventloop::EventLoop;
use crate::workerpool::WorkerPool;

/// Default cap on concurrently running jobs.
pub const DEFAULT_JOB_LIMIT: usize = 3;

/// A job body's failure, reported but never fatal to the queue.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobError(pub String);

/// One admissible unit of background work.
pub trait QueuedJob: Send + 'static {
    /// Subject identity; duplicate requests for the same key are ignored
    /// while the job is queued or running.
    fn key(&self) -> String;

    /// The blocking body. Runs on a worker thread.
    fn run(&mut self) -> Result<(), JobError>;
}

#[derive(Default)]
struct QueueState {
    running: HashSet<String>,
    pending: VecDeque<Box<dyn QueuedJob>>,
    pending_keys: HashSet<String>,
    completed: u64,
}

struct QueueInner {
    limit: usize,
    event_loop: Arc<EventLoop>,
    pool: Arc<WorkerPool>,
    state: Mutex<QueueState>,
}

/// Fixed-concurrency admission queue over the worker pool.
#[derive(Clone)]
pub struct BoundedWorkQueue {
    inner: Arc<QueueInner>,
}

impl BoundedWorkQueue {
    /// Creates a queue running at most `limit` jobs at once.
    pub fn new(event_loop: Arc<EventLoop>, pool: Arc<WorkerPool>, limit: usize) -> Self {
        assert!(limit > 0, "job limit must be at least 1");
        Self {
            inner: Arc::new(QueueInner {
                limit,
                event_loop,
                pool,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Admits a job unless its subject is already queued or running.
    ///
    /// Returns `false` for a duplicate. A subject may be requested again
    /// once its previous run completed.
    pub fn request(&self, job: Box<dyn QueuedJob>) -> bool {
        let key = job.key();
        let mut state = self.inner.state.lock().unwrap();

        if state.running.contains(&key) || state.pending_keys.contains(&key) {
            debug!(%key, "duplicate job request ignored");
            return false;
        }

        if state.running.len() < self.inner.limit {
            state.running.insert(key.clone());
            drop(state);
            QueueInner::start(&self.inner, key, job);
        } else {
            state.pending_keys.insert(key);
            state.pending.push_back(job);
        }
        true
    }

    /// Jobs currently executing.
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().unwrap().running.len()
    }

    /// Jobs waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Jobs that have finished (successfully or not).
    pub fn completed_count(&self) -> u64 {
        self.inner.state.lock().unwrap().completed
    }
}

impl QueueInner {
    fn start(inner: &Arc<QueueInner>, key: String, job: Box<dyn QueuedJob>) {
        let inner_ok = Arc::clone(inner);
        let inner_err = Arc::clone(inner);
        let key_ok = key.clone();
        let key_err = key.clone();

        let delegated = inner.pool.delegate(
            format!("bounded job '{key}'"),
            move || {
                let mut job = job;
                job.run()
            },
            move |()| Self::finish(&inner_ok, &key_ok, None),
            move |error| Self::finish(&inner_err, &key_err, Some(error)),
        );

        if delegated.is_err() {
            warn!(%key, "job dropped: worker pool closed");
            inner.state.lock().unwrap().running.remove(&key);
        }
    }

    /// Marks a job done and promotes queued jobs while capacity remains.
    /// Runs on the event loop thread.
    fn finish(inner: &Arc<QueueInner>, key: &str, error: Option<JobError>) {
        inner
            .event_loop
            .guard()
            .assert_loop_thread("BoundedWorkQueue completion");
        match error {
            Some(error) => warn!(key, %error, "bounded job failed"),
            None => debug!(key, "bounded job done"),
        }

        let promotions = {
            let mut state = inner.state.lock().unwrap();
            state.running.remove(key);
            state.completed += 1;

            let mut promotions = Vec::new();
            while state.running.len() < inner.limit {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                let key = job.key();
                state.pending_keys.remove(&key);
                state.running.insert(key.clone());
                promotions.push((key, job));
            }
            promotions
        };

        // Start promoted jobs outside the state lock.
        for (key, job) in promotions {
            Self::start(inner, key, job);
        }
    }
}
