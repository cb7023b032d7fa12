//! Duplex transport between the main process and the daemon.
//!
//! A [`Channel`] wraps one Unix-domain stream at a time. Writes are
//! serialized through a mutex; reads happen on a dedicated reader thread that
//! blocks on the stream and forwards each inbound record to the protocol
//! layer. Disconnection flips the channel state and notifies watchers; a new
//! stream can be attached afterwards (reconnect), which is how the retry
//! layer recovers.
//!
//! A generation counter guards against a stale reader thread from a previous
//! connection flipping the state of its replacement.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::frame::{read_record, write_record, Record};

/// Returned when sending on a channel with no live connection.
#[derive(Debug, Error)]
#[error("channel is not connected")]
pub struct NotConnected;

type RecordHandler = Arc<dyn Fn(Record) + Send + Sync>;
type StateHandler = Arc<dyn Fn() + Send + Sync>;

struct ChannelState {
    connected: bool,
    generation: u64,
}

/// One duplex record stream, reconnectable.
pub struct Channel {
    writer: Mutex<Option<UnixStream>>,
    state: Mutex<ChannelState>,
    state_changed: Condvar,
    on_record: Mutex<Option<RecordHandler>>,
    on_disconnect: Mutex<Option<StateHandler>>,
    on_connect: Mutex<Option<StateHandler>>,
}

impl Channel {
    /// Creates a channel with no connection attached yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(None),
            state: Mutex::new(ChannelState {
                connected: false,
                generation: 0,
            }),
            state_changed: Condvar::new(),
            on_record: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            on_connect: Mutex::new(None),
        })
    }

    /// Sets the callback invoked (on the reader thread) per inbound record.
    pub fn set_record_handler(&self, handler: impl Fn(Record) + Send + Sync + 'static) {
        *self.on_record.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Sets the callback invoked when the connection is lost.
    pub fn set_disconnect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.on_disconnect.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Sets the callback invoked when a connection is attached.
    pub fn set_connect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.on_connect.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Attaches a stream and starts its reader thread.
    ///
    /// Replaces any previous connection; the old reader thread unwinds on its
    /// dead stream without disturbing the new one.
    pub fn attach(self: &Arc<Self>, stream: UnixStream) -> io::Result<()> {
        let reader = stream.try_clone()?;

        // The writer must be in place before the connected flag flips: a
        // waiter woken by the flip may send immediately.
        *self.writer.lock().unwrap() = Some(stream);
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.connected = true;
            self.state_changed.notify_all();
            state.generation
        };

        let channel = Arc::clone(self);
        thread::Builder::new()
            .name(format!("rpc-reader-{generation}"))
            .spawn(move || channel.read_loop(reader, generation))?;

        debug!(generation, "channel connected");
        if let Some(handler) = self.on_connect.lock().unwrap().clone() {
            handler();
        }
        Ok(())
    }

    fn read_loop(self: Arc<Self>, mut reader: UnixStream, generation: u64) {
        loop {
            match read_record(&mut reader) {
                Ok(record) => {
                    let handler = self.on_record.lock().unwrap().clone();
                    match handler {
                        Some(handler) => handler(record),
                        None => warn!("inbound record dropped: no handler installed"),
                    }
                }
                Err(err) => {
                    self.note_disconnect(generation, &err.to_string());
                    break;
                }
            }
        }
    }

    /// Marks the connection dead and notifies watchers, exactly once per
    /// generation.
    fn note_disconnect(&self, generation: u64, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation || !state.connected {
                return;
            }
            state.connected = false;
            self.state_changed.notify_all();
        }
        warn!(generation, reason, "channel disconnected");
        if let Some(handler) = self.on_disconnect.lock().unwrap().clone() {
            handler();
        }
    }

    /// Writes one record. Fails fast when no connection is live.
    pub fn send(&self, record: &Record) -> Result<(), NotConnected> {
        let write_result = {
            let mut writer = self.writer.lock().unwrap();
            match writer.as_mut() {
                Some(stream) => write_record(stream, record),
                None => return Err(NotConnected),
            }
        };

        match write_result {
            Ok(()) => Ok(()),
            Err(err) => {
                let generation = self.state.lock().unwrap().generation;
                self.note_disconnect(generation, &err.to_string());
                Err(NotConnected)
            }
        }
    }

    /// Returns `true` while a connection is live.
    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Blocks until connected or `timeout` elapses. Do not call on the loop
    /// thread; the protocol layer pumps the loop there instead.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.connected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    /// Drops the current connection, if any. The reader thread notices and
    /// runs the normal disconnect path.
    pub fn disconnect(&self) {
        if let Some(stream) = self.writer.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::payload::Payload;
    use std::sync::mpsc;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn records_flow_between_attached_channels() {
        let (a, b) = pair();
        let left = Channel::new();
        let right = Channel::new();

        let (tx, rx) = mpsc::channel();
        right.set_record_handler(move |record| tx.send(record).unwrap());

        left.attach(a).unwrap();
        right.attach(b).unwrap();

        left.send(&Record::Command {
            id: 1,
            kind: "ping".to_string(),
            payload: Payload::Null,
        })
        .unwrap();

        let record = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(record.id(), 1);
    }

    #[test]
    fn send_without_connection_fails_fast() {
        let channel = Channel::new();
        let result = channel.send(&Record::Reply {
            id: 9,
            result: Ok(Payload::Null),
        });
        assert!(result.is_err());
        assert!(!channel.is_connected());
    }

    #[test]
    fn peer_drop_triggers_disconnect_handler() {
        let (a, b) = pair();
        let channel = Channel::new();

        let (tx, rx) = mpsc::channel();
        channel.set_disconnect_handler(move || tx.send(()).unwrap());
        channel.attach(a).unwrap();
        assert!(channel.is_connected());

        drop(b);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!channel.is_connected());
    }

    #[test]
    fn reattach_restores_connectivity() {
        let (a, b) = pair();
        let channel = Channel::new();
        channel.attach(a).unwrap();

        channel.disconnect();
        drop(b);

        // Wait for the reader to observe the loss.
        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!channel.is_connected());

        let (c, d) = pair();
        channel.attach(c).unwrap();
        assert!(channel.is_connected());
        assert!(channel
            .send(&Record::Reply {
                id: 2,
                result: Ok(Payload::Null),
            })
            .is_ok());
        drop(d);
    }

    #[test]
    fn wait_connected_times_out() {
        let channel = Channel::new();
        assert!(!channel.wait_connected(Duration::from_millis(30)));
    }
}
