//! Thread-confinement checks.
//!
//! All backend state mutation happens on the single scheduler thread; the UI
//! runs on its own thread. The [`ThreadGuard`] records which physical thread
//! is which, and any call that requires the scheduler thread asserts it is
//! actually running there. A violation is a programming error and panics
//! immediately rather than silently corrupting shared state.

use std::sync::OnceLock;
use std::thread::{self, ThreadId};

/// Records the scheduler and UI thread identities.
#[derive(Debug, Default)]
pub struct ThreadGuard {
    loop_thread: OnceLock<ThreadId>,
    ui_thread: OnceLock<ThreadId>,
}

impl ThreadGuard {
    /// Creates a guard with no threads registered yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread as the scheduler thread.
    ///
    /// # Panics
    ///
    /// Panics if a different thread was already registered.
    pub fn register_loop_thread(&self) {
        let current = thread::current().id();
        if self.loop_thread.set(current).is_err() {
            let registered = *self.loop_thread.get().unwrap();
            assert_eq!(
                registered, current,
                "event loop already running on a different thread"
            );
        }
    }

    /// Registers the calling thread as the UI thread.
    pub fn register_ui_thread(&self) {
        let current = thread::current().id();
        if self.ui_thread.set(current).is_err() {
            let registered = *self.ui_thread.get().unwrap();
            assert_eq!(
                registered, current,
                "UI thread already registered as a different thread"
            );
        }
    }

    /// Returns `true` when called on the registered scheduler thread.
    pub fn is_loop_thread(&self) -> bool {
        self.loop_thread.get().copied() == Some(thread::current().id())
    }

    /// Asserts the caller is on the scheduler thread.
    ///
    /// # Panics
    ///
    /// Panics with the offending call site named when on any other thread.
    pub fn assert_loop_thread(&self, what: &str) {
        let registered = self
            .loop_thread
            .get()
            .unwrap_or_else(|| panic!("{what} called before the event loop started"));
        assert_eq!(
            *registered,
            thread::current().id(),
            "{what} called off the event loop thread"
        );
    }

    /// Asserts the caller is on the UI thread.
    pub fn assert_ui_thread(&self, what: &str) {
        let registered = self
            .ui_thread
            .get()
            .unwrap_or_else(|| panic!("{what} called before the UI thread was registered"));
        assert_eq!(
            *registered,
            thread::current().id(),
            "{what} called off the UI thread"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_thread_registration_is_idempotent() {
        let guard = ThreadGuard::new();
        guard.register_loop_thread();
        guard.register_loop_thread();
        assert!(guard.is_loop_thread());
        guard.assert_loop_thread("test");
    }

    #[test]
    fn other_thread_is_not_loop_thread() {
        let guard = std::sync::Arc::new(ThreadGuard::new());
        guard.register_loop_thread();

        let guard2 = std::sync::Arc::clone(&guard);
        std::thread::spawn(move || {
            assert!(!guard2.is_loop_thread());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "off the event loop thread")]
    fn assert_panics_off_thread() {
        let guard = std::sync::Arc::new(ThreadGuard::new());
        let guard2 = std::sync::Arc::clone(&guard);
        std::thread::spawn(move || guard2.register_loop_thread())
            .join()
            .unwrap();
        guard.assert_loop_thread("wrong-thread call");
    }

    #[test]
    #[should_panic(expected = "before the event loop started")]
    fn assert_panics_when_unregistered() {
        let guard = ThreadGuard::new();
        guard.assert_loop_thread("early call");
    }
}
