//! FreeCast download daemon.
//!
//! The main process launches this executable with the control socket path in
//! the environment. The daemon connects back, announces readiness, mirrors
//! configuration pushed by the main process, and serves registered commands
//! on its own event loop until told to shut down. Risky download work lives
//! here so a crash degrades downloads instead of killing the UI process.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use freecast::config::{RpcSettings, RuntimeConfig};
use freecast::remoteconfig::{self, RemoteConfig};
use freecast::rpc::{self, Channel, DaemonRpc, Payload, PING_COMMAND};
use freecast::runtime::Runtime;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        error!(error = %err, "daemon failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), rpc::SpawnError> {
    let runtime = Runtime::new(RuntimeConfig::default());
    let channel = Channel::new();
    let rpc_layer = DaemonRpc::new(
        Arc::clone(runtime.event_loop()),
        Arc::clone(&channel),
        runtime.event_loop().trap().clone(),
        RpcSettings::default(),
    );

    // Built-in command surface. Applications register their download and
    // object-store handlers on top of this before the loop runs.
    let remote_config = RemoteConfig::new();
    remoteconfig::install_handlers(&rpc_layer, Arc::clone(&remote_config));
    rpc::install_shutdown_handler(&rpc_layer, Arc::clone(runtime.event_loop()));
    rpc_layer.register_handler(PING_COMMAND, |_| Ok(Payload::from(freecast::VERSION)));

    let socket = rpc::connect_from_env(&channel)?;
    info!(
        version = freecast::VERSION,
        socket = %socket.display(),
        "download daemon connected"
    );
    rpc::announce_ready(&rpc_layer);

    runtime.run();
    runtime.shutdown();
    info!("download daemon exiting");
    Ok(())
}
