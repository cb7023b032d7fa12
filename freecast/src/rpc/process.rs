//! Daemon process lifecycle.
//!
//! The main process owns the control socket: it binds a listener on a
//! private path, spawns the daemon executable with the path in
//! [`DAEMON_SOCKET_ENV`], accepts the daemon's connection, and waits for the
//! daemon's `ready` command before relying on it. Shutdown is the reverse:
//! send `shutdown`, wait a bounded period for the process to exit, kill it
//! if it overstays.
//!
//! The daemon side uses [`connect_from_env`] and [`announce_ready`].

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::connection::{DaemonRpc, READY_COMMAND, SHUTDOWN_COMMAND};
use super::payload::Payload;
use crate::eventloop::EventLoop;

/// Environment variable carrying the control socket path to the daemon.
pub const DAEMON_SOCKET_ENV: &str = "FREECAST_DAEMON_SOCKET";

/// How long the main process waits for the daemon to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the main process waits for the daemon's exit after `shutdown`.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors launching or adopting the daemon process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("daemon process I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("daemon did not connect within {0:?}")]
    AcceptTimeout(Duration),

    #[error("FREECAST_DAEMON_SOCKET is not set; not launched by the main process?")]
    MissingEnvironment,
}

/// A running daemon process and its control socket.
pub struct DaemonProcess {
    child: Child,
    socket_path: PathBuf,
}

impl DaemonProcess {
    /// Launches `executable` and attaches its connection to `channel`.
    ///
    /// The control socket is created under `socket_dir`; a stale socket file
    /// from a crashed previous run is removed first.
    pub fn launch(
        executable: &Path,
        socket_dir: &Path,
        channel: &Arc<Channel>,
    ) -> Result<Self, SpawnError> {
        let socket_path = socket_dir.join("daemon.sock");
        remove_stale_socket(&socket_path);

        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        let child = Command::new(executable)
            .env(DAEMON_SOCKET_ENV, &socket_path)
            .spawn()?;
        info!(pid = child.id(), socket = %socket_path.display(), "daemon launched");

        let stream = accept_with_deadline(&listener, ACCEPT_TIMEOUT)?;
        stream.set_nonblocking(false)?;
        channel.attach(stream)?;

        Ok(Self { child, socket_path })
    }

    /// The daemon's process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Sends `shutdown` and waits (bounded) for the process to exit,
    /// killing it if it overstays.
    pub fn shutdown(mut self, rpc: &DaemonRpc) -> io::Result<ExitStatus> {
        rpc.call_async(SHUTDOWN_COMMAND, Payload::Null, |_| {});

        let deadline = Instant::now() + EXIT_TIMEOUT;
        let status = loop {
            match self.child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    warn!(pid = self.child.id(), "daemon did not exit in time, killing");
                    self.child.kill()?;
                    break self.child.wait()?;
                }
                None => thread::sleep(Duration::from_millis(50)),
            }
        };

        remove_stale_socket(&self.socket_path);
        info!(%status, "daemon exited");
        Ok(status)
    }
}

fn accept_with_deadline(
    listener: &UnixListener,
    timeout: Duration,
) -> Result<UnixStream, SpawnError> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Ok(stream),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(SpawnError::AcceptTimeout(timeout));
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn remove_stale_socket(path: &Path) {
    if path.exists() {
        debug!(socket = %path.display(), "removing stale socket");
        if let Err(err) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %err, "failed to remove socket file");
        }
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Observes the daemon's one-time `ready` command.
///
/// Install before launching, then [`wait`](Self::wait) from any thread other
/// than the event loop thread (the handler needs the loop to run).
pub struct ReadySignal {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    /// Registers the `ready` handler on the main-process side.
    pub fn install(rpc: &DaemonRpc) -> Self {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&state);
        rpc.register_handler(READY_COMMAND, move |_| {
            let (ready, signalled) = &*shared;
            *ready.lock().unwrap() = true;
            signalled.notify_all();
            debug!("daemon signalled readiness");
            Ok(Payload::Null)
        });
        Self { state }
    }

    /// Blocks until the daemon has signalled readiness or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (ready, signalled) = &*self.state;
        let mut ready = ready.lock().unwrap();
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = signalled.wait_timeout(ready, deadline - now).unwrap();
            ready = guard;
        }
        true
    }
}

// =============================================================================
// Daemon side
// =============================================================================

/// Connects back to the main process using the environment-provided socket
/// path. Returns the path for logging.
pub fn connect_from_env(channel: &Arc<Channel>) -> Result<PathBuf, SpawnError> {
    let path = std::env::var_os(DAEMON_SOCKET_ENV)
        .map(PathBuf::from)
        .ok_or(SpawnError::MissingEnvironment)?;
    let stream = UnixStream::connect(&path)?;
    channel.attach(stream)?;
    Ok(path)
}

/// Sends the daemon's one-time `ready` command.
pub fn announce_ready(rpc: &DaemonRpc) {
    rpc.call_async(READY_COMMAND, Payload::Null, |result| {
        if let Err(err) = result {
            warn!(error = %err, "ready announcement was not acknowledged");
        }
    });
}

/// Registers the standard `shutdown` handler: quit the local loop.
pub fn install_shutdown_handler(rpc: &DaemonRpc, event_loop: Arc<EventLoop>) {
    rpc.register_handler(SHUTDOWN_COMMAND, move |_| {
        info!("shutdown command received");
        event_loop.quit();
        Ok(Payload::Null)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_from_env_requires_the_variable() {
        // The variable is only ever set in a spawned daemon's environment.
        std::env::remove_var(DAEMON_SOCKET_ENV);
        let channel = Channel::new();
        assert!(matches!(
            connect_from_env(&channel),
            Err(SpawnError::MissingEnvironment)
        ));
    }

    #[test]
    fn stale_socket_removal_is_quiet_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        remove_stale_socket(&dir.path().join("no-such.sock"));
    }

    #[test]
    fn accept_deadline_expires_without_a_peer() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("lonely.sock")).unwrap();
        listener.set_nonblocking(true).unwrap();

        let result = accept_with_deadline(&listener, Duration::from_millis(50));
        assert!(matches!(result, Err(SpawnError::AcceptTimeout(_))));
    }
}
