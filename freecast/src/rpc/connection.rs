//! Command/reply protocol layer.
//!
//! [`DaemonRpc`] sits between one process's event loop and its [`Channel`]
//! to the peer process. Outbound commands are serialized with a
//! process-unique id; replies are matched back to their waiter strictly by
//! that id, never by arrival order. Inbound commands dispatch by kind to a
//! registered handler on the receiving side's event loop - never on the
//! transport thread - inside the failure trap, so a handler fault becomes a
//! failure report and an error reply instead of protocol corruption.
//!
//! Per-command state machine:
//!
//! ```text
//! CREATED → SENT → { REPLIED | DISCONNECTED → (RETRY → SENT | ABANDONED) } → DONE
//! ```
//!
//! Retries mint a fresh id so an eventual reply to the dead attempt can never
//! be confused with the live one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::channel::Channel;
use super::frame::Record;
use super::payload::Payload;
use crate::config::RpcSettings;
use crate::eventloop::EventLoop;
use crate::trap::FailureTrap;
use crate::workerpool::WorkerPool;

/// Command kind the daemon sends once its loop is up.
pub const READY_COMMAND: &str = "ready";

/// Command kind asking the receiver to stop its loop.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// Command kind for liveness checks.
pub const PING_COMMAND: &str = "ping";

/// Errors surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel was down and retries (if any) were exhausted.
    #[error("daemon unavailable: channel disconnected")]
    Disconnected,

    /// The remote handler ran and returned an error.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Chained synchronous calls exceeded the nesting cap.
    #[error("synchronous call nesting limit reached")]
    NestedCallLimit,

    /// The local event loop quit while waiting for the reply.
    #[error("event loop quit while waiting for a reply")]
    Interrupted,
}

/// An inbound-command handler body.
pub type HandlerFn = Arc<dyn Fn(Payload) -> Result<Payload, String> + Send + Sync>;

/// How a registered handler executes.
#[derive(Clone)]
enum Handler {
    /// Runs directly on the event loop.
    Loop(HandlerFn),
    /// Admitted on the loop, body delegated to the worker pool; the reply is
    /// sent when the blocking call completes. Keeps slow commands from
    /// stalling replies to fast ones.
    Blocking(Arc<WorkerPool>, HandlerFn),
}

enum WaitState {
    Waiting,
    Replied(Result<Payload, String>),
    Disconnected,
}

struct SyncWaiter {
    state: Mutex<WaitState>,
    resolved: Condvar,
}

impl SyncWaiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Waiting),
            resolved: Condvar::new(),
        }
    }

    fn resolve(&self, state: WaitState) {
        let mut current = self.state.lock().unwrap();
        if matches!(*current, WaitState::Waiting) {
            *current = state;
            self.resolved.notify_all();
        }
    }

    fn is_resolved(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), WaitState::Waiting)
    }
}

type ReplyCallback = Box<dyn FnOnce(Result<Payload, RpcError>) + Send>;

enum PendingEntry {
    Sync(Arc<SyncWaiter>),
    Async(Mutex<Option<ReplyCallback>>),
}

/// The protocol layer for one side of the main/daemon pair.
#[derive(Clone)]
pub struct DaemonRpc {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    event_loop: Arc<EventLoop>,
    channel: Arc<Channel>,
    trap: FailureTrap,
    settings: RpcSettings,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingEntry>,
    handlers: Mutex<HashMap<String, Handler>>,
    /// Ensures one outage report per outage, not one per pending command.
    outage_reported: AtomicBool,
}

impl DaemonRpc {
    /// Wires the protocol layer onto a channel and event loop.
    pub fn new(
        event_loop: Arc<EventLoop>,
        channel: Arc<Channel>,
        trap: FailureTrap,
        settings: RpcSettings,
    ) -> Self {
        let inner = Arc::new(RpcInner {
            event_loop,
            channel: Arc::clone(&channel),
            trap,
            settings,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            handlers: Mutex::new(HashMap::new()),
            outage_reported: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        channel.set_record_handler(move |record| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_record(record);
            }
        });

        let weak = Arc::downgrade(&inner);
        channel.set_disconnect_handler(move || {
            if let Some(inner) = weak.upgrade() {
                inner.fail_all_pending();
            }
        });

        let weak = Arc::downgrade(&inner);
        channel.set_connect_handler(move || {
            if let Some(inner) = weak.upgrade() {
                inner.outage_reported.store(false, Ordering::Release);
                // A pumping synchronous caller may be waiting on this.
                inner.event_loop.wakeup();
            }
        });

        Self { inner }
    }

    /// Registers the handler for an inbound command kind.
    ///
    /// The handler runs on this side's event loop inside the failure trap;
    /// its return value is serialized back as the reply. Handlers registered
    /// this way must not block - use
    /// [`register_blocking_handler`](Self::register_blocking_handler) for
    /// anything that touches disk or network.
    pub fn register_handler(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(Payload) -> Result<Payload, String> + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(kind.into(), Handler::Loop(Arc::new(handler)));
    }

    /// Registers a handler whose body runs on the worker pool.
    ///
    /// The command is still admitted on the event loop, but the (blocking)
    /// body executes on a pool thread and the reply goes out when it
    /// completes. Replies to other commands keep flowing meanwhile.
    pub fn register_blocking_handler(
        &self,
        kind: impl Into<String>,
        pool: Arc<WorkerPool>,
        handler: impl Fn(Payload) -> Result<Payload, String> + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(kind.into(), Handler::Blocking(pool, Arc::new(handler)));
    }

    /// Sends a command and blocks until its reply or a disconnect.
    ///
    /// On the scheduler thread the wait is a nested pump: urgent tasks and
    /// due timeouts keep running. Fails fast on disconnect.
    pub fn call(&self, kind: &str, payload: Payload) -> Result<Payload, RpcError> {
        self.inner.call_blocking(kind, payload, false)
    }

    /// Like [`call`](Self::call), but resends (with a fresh id, after a
    /// bounded backoff) when the channel reports a disconnect, up to the
    /// configured attempt ceiling.
    pub fn call_with_retry(&self, kind: &str, payload: Payload) -> Result<Payload, RpcError> {
        self.inner.call_blocking(kind, payload, true)
    }

    /// Sends a command and delivers the reply to `on_reply` as an urgent
    /// task on this side's event loop. Fails fast on disconnect.
    pub fn call_async(
        &self,
        kind: &str,
        payload: Payload,
        on_reply: impl FnOnce(Result<Payload, RpcError>) + Send + 'static,
    ) {
        self.inner.call_async(kind, payload, Box::new(on_reply));
    }

    /// Number of commands currently awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl RpcInner {
    fn call_blocking(&self, kind: &str, payload: Payload, retry: bool) -> Result<Payload, RpcError> {
        let on_loop = self.event_loop.guard().is_loop_thread();
        if on_loop && self.event_loop.nested_depth() >= self.settings.max_nested_calls {
            return Err(RpcError::NestedCallLimit);
        }

        let max_attempts = if retry { self.settings.max_attempts } else { 1 };
        let mut backoff = self.settings.initial_backoff;

        for attempt in 1..=max_attempts {
            // A fresh id per attempt: a late reply to a dead attempt can
            // never match the live waiter.
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let waiter = Arc::new(SyncWaiter::new());
            self.pending
                .insert(id, PendingEntry::Sync(Arc::clone(&waiter)));

            let record = Record::Command {
                id,
                kind: kind.to_string(),
                payload: payload.clone(),
            };

            let outcome = if self.channel.send(&record).is_ok() {
                self.wait_for_reply(&waiter, on_loop)
            } else {
                Ok(WaitState::Disconnected)
            };
            self.pending.remove(&id);

            match outcome? {
                WaitState::Replied(Ok(reply)) => return Ok(reply),
                WaitState::Replied(Err(message)) => return Err(RpcError::Remote(message)),
                WaitState::Disconnected => {
                    if attempt == max_attempts {
                        break;
                    }
                    debug!(kind, attempt, "channel down, waiting to retry");
                    self.wait_for_connection(backoff, on_loop);
                    backoff = (backoff * 2).min(self.settings.backoff_cap);
                }
                WaitState::Waiting => unreachable!("wait returned while still waiting"),
            }
        }

        self.report_outage();
        Err(RpcError::Disconnected)
    }

    fn wait_for_reply(
        &self,
        waiter: &Arc<SyncWaiter>,
        on_loop: bool,
    ) -> Result<WaitState, RpcError> {
        if on_loop {
            let resolved = {
                let waiter = Arc::clone(waiter);
                self.event_loop
                    .pump_until(None, move || waiter.is_resolved())
            };
            if !resolved {
                return Err(RpcError::Interrupted);
            }
        } else {
            let mut state = waiter.state.lock().unwrap();
            while matches!(*state, WaitState::Waiting) {
                state = waiter.resolved.wait(state).unwrap();
            }
        }

        let mut state = waiter.state.lock().unwrap();
        Ok(std::mem::replace(&mut *state, WaitState::Waiting))
    }

    fn wait_for_connection(&self, window: Duration, on_loop: bool) {
        if on_loop {
            let channel = Arc::clone(&self.channel);
            self.event_loop
                .pump_until(Some(window), move || channel.is_connected());
        } else {
            self.channel.wait_connected(window);
        }
    }

    fn call_async(&self, kind: &str, payload: Payload, on_reply: ReplyCallback) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending
            .insert(id, PendingEntry::Async(Mutex::new(Some(on_reply))));

        let record = Record::Command {
            id,
            kind: kind.to_string(),
            payload,
        };
        if self.channel.send(&record).is_err() {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.deliver_async(entry, Err(RpcError::Disconnected));
            }
        }
    }

    /// Routes one inbound record. Runs on the channel reader thread; the
    /// only thing done here is enqueueing onto the event loop.
    fn handle_record(self: &Arc<Self>, record: Record) {
        match record {
            Record::Command { id, kind, payload } => {
                let handler = self.handlers.lock().unwrap().get(&kind).cloned();
                let inner = Arc::clone(self);
                self.event_loop
                    .schedule_urgent(format!("rpc command '{kind}'"), move || {
                        inner.dispatch_command(id, &kind, payload, handler);
                    });
            }
            Record::Reply { id, result } => match self.pending.remove(&id) {
                Some((_, PendingEntry::Sync(waiter))) => {
                    waiter.resolve(WaitState::Replied(result));
                    // A pumping synchronous caller parks on the loop.
                    self.event_loop.wakeup();
                }
                Some((_, entry @ PendingEntry::Async(_))) => {
                    self.deliver_async(entry, result.map_err(RpcError::Remote));
                }
                None => {
                    warn!(id, "reply with no waiter dropped");
                }
            },
        }
    }

    /// Runs a command handler and sends the reply. Executes on the loop
    /// thread; blocking handlers hand their body to the worker pool.
    fn dispatch_command(&self, id: u64, kind: &str, payload: Payload, handler: Option<Handler>) {
        let label = format!("handling '{kind}' command");

        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!(kind, "command with no registered handler");
                self.send_reply(id, kind, Err(format!("no handler registered for '{kind}'")));
                return;
            }
        };

        match handler {
            Handler::Loop(f) => {
                let result = match self.trap.run_with_result(&label, || f(payload)) {
                    Some(result) => result,
                    None => Err(format!("handler for '{kind}' failed")),
                };
                self.send_reply(id, kind, result);
            }
            Handler::Blocking(pool, f) => {
                let trap = self.trap.clone();
                let channel = Arc::clone(&self.channel);
                let kind_owned = kind.to_string();
                let kind_for_reply = kind_owned.clone();

                let delegated = pool.delegate(
                    label.clone(),
                    move || -> Result<Result<Payload, String>, String> {
                        match trap.run_with_result(&label, || f(payload)) {
                            Some(result) => Ok(result),
                            None => Ok(Err(format!("handler for '{kind_owned}' failed"))),
                        }
                    },
                    move |result| {
                        let reply = Record::Reply { id, result };
                        if channel.send(&reply).is_err() {
                            warn!(id, kind = %kind_for_reply, "reply dropped: channel disconnected");
                        }
                    },
                    |_unused: String| {},
                );

                if delegated.is_err() {
                    self.send_reply(id, kind, Err("daemon worker pool closed".to_string()));
                }
            }
        }
    }

    fn send_reply(&self, id: u64, kind: &str, result: Result<Payload, String>) {
        let reply = Record::Reply { id, result };
        if self.channel.send(&reply).is_err() {
            warn!(id, kind, "reply dropped: channel disconnected");
        }
    }

    fn deliver_async(&self, entry: PendingEntry, result: Result<Payload, RpcError>) {
        let PendingEntry::Async(callback) = entry else {
            return;
        };
        let taken = callback.lock().unwrap().take();
        if let Some(callback) = taken {
            self.event_loop
                .schedule_urgent("rpc reply callback", move || callback(result));
        }
    }

    /// Fails every pending command. Runs on disconnect.
    fn fail_all_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                match entry {
                    PendingEntry::Sync(waiter) => waiter.resolve(WaitState::Disconnected),
                    entry @ PendingEntry::Async(_) => {
                        self.deliver_async(entry, Err(RpcError::Disconnected));
                    }
                }
            }
        }
        self.event_loop.wakeup();
    }

    /// Reports daemon unavailability once per outage, never per command.
    fn report_outage(&self) {
        if !self.outage_reported.swap(true, Ordering::AcqRel) {
            self.trap.report(
                "daemon connection",
                "daemon unavailable after exhausting retries".to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::trap::NullFailureSink;
    use std::os::unix::net::UnixStream;
    use std::thread;

    struct Side {
        event_loop: Arc<EventLoop>,
        channel: Arc<Channel>,
        rpc: DaemonRpc,
        join: Option<thread::JoinHandle<()>>,
    }

    impl Side {
        fn new() -> Self {
            let clock = Arc::new(Clock::new());
            let trap = FailureTrap::new(Arc::new(NullFailureSink), Arc::clone(&clock));
            let event_loop = EventLoop::new(trap.clone(), clock);
            let channel = Channel::new();
            let rpc = DaemonRpc::new(
                Arc::clone(&event_loop),
                Arc::clone(&channel),
                trap,
                RpcSettings::default(),
            );
            let loop_for_thread = Arc::clone(&event_loop);
            let join = thread::spawn(move || loop_for_thread.run());
            Self {
                event_loop,
                channel,
                rpc,
                join: Some(join),
            }
        }
    }

    impl Drop for Side {
        fn drop(&mut self) {
            self.event_loop.quit();
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }

    fn connected_sides() -> (Side, Side) {
        let main = Side::new();
        let daemon = Side::new();
        let (a, b) = UnixStream::pair().unwrap();
        main.channel.attach(a).unwrap();
        daemon.channel.attach(b).unwrap();
        (main, daemon)
    }

    #[test]
    fn call_reaches_handler_and_returns_reply() {
        let (main, daemon) = connected_sides();

        daemon.rpc.register_handler("echo", |payload| Ok(payload));

        let reply = main
            .rpc
            .call("echo", Payload::from("hello daemon"))
            .unwrap();
        assert_eq!(reply.as_text(), Some("hello daemon"));
        assert_eq!(main.rpc.pending_count(), 0);
    }

    #[test]
    fn handler_error_becomes_remote_error() {
        let (main, daemon) = connected_sides();

        daemon
            .rpc
            .register_handler("fail", |_| Err("nope".to_string()));

        match main.rpc.call("fail", Payload::Null) {
            Err(RpcError::Remote(message)) => assert_eq!(message, "nope"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_an_error_reply_not_a_crash() {
        let (main, _daemon) = connected_sides();

        match main.rpc.call("no_such_command", Payload::Null) {
            Err(RpcError::Remote(message)) => {
                assert!(message.contains("no handler"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn handler_panic_is_trapped_and_reported_remotely() {
        let (main, daemon) = connected_sides();

        daemon
            .rpc
            .register_handler("explode", |_| panic!("handler bug"));

        match main.rpc.call("explode", Payload::Null) {
            Err(RpcError::Remote(message)) => assert!(message.contains("failed")),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The daemon loop survives the fault.
        daemon.rpc.register_handler("echo", |payload| Ok(payload));
        assert!(main.rpc.call("echo", Payload::Null).is_ok());
    }

    #[test]
    fn call_without_retry_fails_fast_when_disconnected() {
        let main = Side::new();
        match main.rpc.call("anything", Payload::Null) {
            Err(RpcError::Disconnected) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn async_reply_is_delivered_on_the_loop() {
        let (main, daemon) = connected_sides();
        daemon.rpc.register_handler("echo", |payload| Ok(payload));

        let (tx, rx) = std::sync::mpsc::channel();
        let loop_for_check = Arc::clone(&main.event_loop);
        main.rpc
            .call_async("echo", Payload::from(5i64), move |result| {
                let on_loop = loop_for_check.guard().is_loop_thread();
                tx.send((result.unwrap().as_int(), on_loop)).unwrap();
            });

        let (value, on_loop) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(value, Some(5));
        assert!(on_loop);
    }

    #[test]
    fn out_of_order_replies_match_by_id() {
        let (main, daemon) = connected_sides();

        // The slow command's body runs on the daemon's worker pool, so the
        // fast command's reply is not stuck behind it.
        let pool = Arc::new(WorkerPool::new(Arc::clone(&daemon.event_loop), 2));
        daemon
            .rpc
            .register_blocking_handler("slow", Arc::clone(&pool), |payload| {
                thread::sleep(Duration::from_millis(200));
                Ok(payload)
            });
        daemon.rpc.register_handler("fast", |payload| Ok(payload));

        // Caller A (off-loop thread): slow command sent first.
        let rpc_a = main.rpc.clone();
        let a = thread::spawn(move || {
            let started = std::time::Instant::now();
            let reply = rpc_a.call("slow", Payload::from("a")).unwrap();
            (reply, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));

        // Caller B: fast command sent second, must not wait for A's.
        let started = std::time::Instant::now();
        let reply_b = main.rpc.call("fast", Payload::from("b")).unwrap();
        let b_elapsed = started.elapsed();

        assert_eq!(reply_b.as_text(), Some("b"));
        assert!(
            b_elapsed < Duration::from_millis(150),
            "fast reply waited for the slow one: {b_elapsed:?}"
        );

        let (reply_a, _) = a.join().unwrap();
        assert_eq!(reply_a.as_text(), Some("a"));
    }

    #[test]
    fn synchronous_call_from_a_loop_task_pumps_the_loop() {
        let (main, daemon) = connected_sides();
        daemon.rpc.register_handler("echo", |payload| Ok(payload));

        // A task on the main loop makes a blocking call; the nested pump
        // keeps the loop alive until the reply lands.
        let (tx, rx) = std::sync::mpsc::channel();
        let rpc = main.rpc.clone();
        main.event_loop.schedule_urgent("sync call from task", move || {
            let reply = rpc.call("echo", Payload::from(7i64));
            tx.send(reply).unwrap();
        });

        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply.as_int(), Some(7));
    }

    #[test]
    fn disconnect_fails_pending_calls() {
        let (main, daemon) = connected_sides();

        // A handler that never gets to reply in time: the channel dies first.
        daemon.rpc.register_handler("hang", |payload| {
            thread::sleep(Duration::from_millis(500));
            Ok(payload)
        });

        let rpc = main.rpc.clone();
        let caller = thread::spawn(move || rpc.call("hang", Payload::Null));

        thread::sleep(Duration::from_millis(50));
        main.channel.disconnect();

        match caller.join().unwrap() {
            Err(RpcError::Disconnected) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
