//! Monotonic time source for the scheduler.
//!
//! All timeout ordering and rate calculations in the backend go through a
//! single [`Clock`] so that a system-clock jump or rollback can never reorder
//! pending timeouts. The clock reports elapsed time since its creation and
//! guarantees the reported value never decreases, even if the underlying
//! platform timer misbehaves.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic, never-regressing time source.
///
/// Readings are durations since the clock was created. Every reading is at
/// least as large as the previous one; a platform timer that steps backwards
/// is clamped to the last value handed out.
#[derive(Debug)]
pub struct Clock {
    origin: Instant,
    last: Mutex<Duration>,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: Mutex::new(Duration::ZERO),
        }
    }

    /// Returns the elapsed time since the clock was created.
    ///
    /// Never returns a value smaller than a previously returned one.
    pub fn now(&self) -> Duration {
        let elapsed = self.origin.elapsed();
        let mut last = self.last.lock().unwrap();
        if elapsed > *last {
            *last = elapsed;
        }
        *last
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readings_advance() {
        let clock = Clock::new();
        let a = clock.now();
        thread::sleep(Duration::from_millis(5));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn readings_never_regress_across_threads() {
        let clock = Arc::new(Clock::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                let mut prev = Duration::ZERO;
                for _ in 0..1000 {
                    let now = clock.now();
                    assert!(now >= prev, "clock regressed: {:?} < {:?}", now, prev);
                    prev = now;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
