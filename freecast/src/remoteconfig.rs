//! Configuration mirror replicated from the main process.
//!
//! The daemon never owns preferences; it holds a key/value mirror pushed by
//! the main process. The mirror is only valid after the one-time initial
//! snapshot, so reads block on a readiness barrier that is satisfied exactly
//! once - a racing early read waits instead of silently seeing defaults.
//! Incremental updates fan out to registered change listeners.
//!
//! The main process pushes the snapshot immediately after the daemon signals
//! readiness, before any command whose handler might read configuration, so
//! loop-thread handlers never block here in practice.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::rpc::{DaemonRpc, Payload, RpcError};

/// Command kind carrying the initial snapshot.
pub const SET_CONFIG_COMMAND: &str = "config.set";

/// Command kind carrying one incremental update.
pub const UPDATE_CONFIG_COMMAND: &str = "config.update";

type ChangeCallback = Arc<dyn Fn(&str, &Payload) + Send + Sync>;

/// The daemon-side key/value mirror.
pub struct RemoteConfig {
    table: Mutex<Option<BTreeMap<String, Payload>>>,
    ready: Condvar,
    listeners: Mutex<Vec<ChangeCallback>>,
}

impl RemoteConfig {
    /// Creates an uninitialized mirror; reads block until the snapshot.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(None),
            ready: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Installs the full snapshot.
    ///
    /// The first call satisfies the readiness barrier; the barrier is never
    /// reset. A later snapshot replaces the table contents wholesale.
    pub fn set_dictionary(&self, entries: BTreeMap<String, Payload>) {
        let mut table = self.table.lock().unwrap();
        let first = table.is_none();
        debug!(entries = entries.len(), first, "configuration snapshot installed");
        *table = Some(entries);
        if first {
            self.ready.notify_all();
        }
    }

    /// Applies one incremental update and fans it out to listeners.
    ///
    /// An update arriving before the snapshot is a protocol violation and is
    /// dropped with a warning.
    pub fn update(&self, key: &str, value: Payload) {
        {
            let mut table = self.table.lock().unwrap();
            match table.as_mut() {
                Some(entries) => {
                    entries.insert(key.to_string(), value.clone());
                }
                None => {
                    warn!(key, "configuration update before initial snapshot dropped");
                    return;
                }
            }
        }

        // Listeners run outside the table lock; one may read config again.
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(key, &value);
        }
    }

    /// Reads one value, blocking until the initial snapshot has arrived.
    ///
    /// Never returns a default due to a race: before readiness the call
    /// waits; after readiness it returns immediately.
    pub fn get(&self, key: &str) -> Option<Payload> {
        let mut table = self.table.lock().unwrap();
        while table.is_none() {
            table = self.ready.wait(table).unwrap();
        }
        table.as_ref().unwrap().get(key).cloned()
    }

    /// Returns `true` once the initial snapshot has been installed.
    pub fn is_ready(&self) -> bool {
        self.table.lock().unwrap().is_some()
    }

    /// Registers a listener invoked for every incremental update.
    pub fn add_change_callback(&self, listener: impl Fn(&str, &Payload) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Arc::new(listener));
    }
}

// =============================================================================
// Protocol wiring
// =============================================================================

/// Registers the daemon-side command handlers feeding `config`.
pub fn install_handlers(rpc: &DaemonRpc, config: Arc<RemoteConfig>) {
    let mirror = Arc::clone(&config);
    rpc.register_handler(SET_CONFIG_COMMAND, move |payload| {
        let entries = payload
            .as_map()
            .ok_or_else(|| "config.set payload must be a map".to_string())?
            .clone();
        mirror.set_dictionary(entries);
        Ok(Payload::Null)
    });

    rpc.register_handler(UPDATE_CONFIG_COMMAND, move |payload| {
        let key = payload
            .get("key")
            .and_then(Payload::as_text)
            .ok_or_else(|| "config.update payload needs a 'key'".to_string())?
            .to_string();
        let value = payload.get("value").cloned().unwrap_or(Payload::Null);
        config.update(&key, value);
        Ok(Payload::Null)
    });
}

/// Main-process side: pushes the initial snapshot.
pub fn push_snapshot(
    rpc: &DaemonRpc,
    entries: BTreeMap<String, Payload>,
) -> Result<(), RpcError> {
    rpc.call_with_retry(SET_CONFIG_COMMAND, Payload::Map(entries))
        .map(|_| ())
}

/// Main-process side: pushes one key change.
pub fn push_update(rpc: &DaemonRpc, key: &str, value: Payload) -> Result<(), RpcError> {
    let payload = Payload::map([
        ("key".to_string(), Payload::from(key)),
        ("value".to_string(), value),
    ]);
    rpc.call_with_retry(UPDATE_CONFIG_COMMAND, payload).map(|_| ())
}
