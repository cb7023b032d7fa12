//! Cross-process command protocol.
//!
//! The main process and the download daemon talk over one duplex stream
//! carrying length-framed command/reply records. This module provides the
//! whole stack:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DaemonRpc                            │
//! │  call / call_with_retry / call_async · handler dispatch     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                         Channel                             │
//! │  mutex-serialized writes · blocking reader thread ·         │
//! │  reconnect generations                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     frame / payload                         │
//! │  u32-length-prefixed JSON records over nested values        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads are opaque here: the downloader and the object store are invoked
//! through commands whose meaning only the two endpoints know. The protocol
//! core dispatches by kind and correlates replies by id, nothing more.

mod channel;
mod connection;
mod frame;
mod payload;
mod process;

pub use channel::{Channel, NotConnected};
pub use connection::{
    DaemonRpc, HandlerFn, RpcError, PING_COMMAND, READY_COMMAND, SHUTDOWN_COMMAND,
};
pub use frame::{read_record, write_record, FrameError, Record, MAX_FRAME_SIZE};
pub use payload::Payload;
pub use process::{
    announce_ready, connect_from_env, install_shutdown_handler, DaemonProcess, ReadySignal,
    SpawnError, ACCEPT_TIMEOUT, DAEMON_SOCKET_ENV, EXIT_TIMEOUT,
};
