//! Cooperative Event Scheduler
//!
//! This module provides the single-threaded event loop that owns the backend
//! process's control flow, plus the pieces it is composed from.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventLoop                            │
//! │  run(): drain urgent → fire due timeouts → one idle slice   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌─────────┐  │
//! │  │ TaskQueue  │ │ TaskQueue  │ │ TimeoutHeap │ │ Thread  │  │
//! │  │ (urgent)   │ │ (idle)     │ │             │ │ Guard   │  │
//! │  └────────────┘ └────────────┘ └─────────────┘ └─────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Scheduling calls are safe from any thread; a parked loop is woken when
//! work arrives. Execution stays on the one loop thread, and every callable
//! runs through the loop's failure trap so a fault in one task never takes
//! the scheduler down.

mod core;
mod guard;
mod task;
mod timeout;

pub use self::core::{EventLoop, IterateStep, LoopStats};
pub use guard::ThreadGuard;
pub use timeout::TimeoutHandle;
