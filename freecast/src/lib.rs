//! FreeCast backend concurrency core.
//!
//! FreeCast's backend runs long-lived network and disk operations - feed
//! polling, downloads, metadata extraction - without blocking the
//! single-threaded UI, and survives the crash of the downloading subsystem
//! without taking the application down. This crate is the machinery that
//! makes both true:
//!
//! - [`eventloop`] - the cooperative single-threaded scheduler that
//!   serializes all backend state mutation,
//! - [`workerpool`] - the bounded pool of threads blocking calls are
//!   delegated to,
//! - [`rpc`] - the command/reply protocol to the separate download-daemon
//!   process, with retry and reconnection,
//! - [`remoteconfig`] - the daemon's mirror of main-process configuration,
//! - [`workqueue`] - fixed-concurrency admission for background jobs,
//! - [`trap`] - the failure-isolation wrapper around every scheduled
//!   callable,
//! - [`runtime`] - the per-process context object tying it together.
//!
//! # High-Level API
//!
//! ```ignore
//! use freecast::config::RuntimeConfig;
//! use freecast::runtime::Runtime;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! runtime.event_loop().schedule_urgent("poll feeds", || {
//!     // ... runs on the scheduler thread ...
//! });
//! runtime.run();
//! ```

pub mod clock;
pub mod config;
pub mod eventloop;
pub mod remoteconfig;
pub mod rpc;
pub mod runtime;
pub mod trap;
pub mod workerpool;
pub mod workqueue;

/// Version of the FreeCast core and daemon.
///
/// Synchronized across the workspace; injected from `Cargo.toml` at compile
/// time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
