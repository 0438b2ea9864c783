//! Fiber runtime with an epoll reactor and blocking-call interception.
//!
//! This crate runs blocking-style code on a small pool of OS threads without
//! blocking them. Code runs inside stackful fibers; when a fiber would block
//! on a socket or a sleep, it is parked and the thread moves on.
//!
//! # Architecture
//!
//! - **Fiber**: stackful coroutine with its own guarded stack
//! - **Scheduler**: M:N scheduler multiplexing fibers and callbacks over worker threads
//! - **TimerManager**: timers ordered by expiry, with clock rollback detection
//! - **IoManager**: scheduler plus timers plus an edge-triggered epoll reactor
//! - **hook**: fiber-aware `read`, `write`, `connect`, `sleep`, ... with POSIX signatures
//! - **RuntimeBuilder**: fluent construction of the above
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{RuntimeBuilder, hook};
//!
//! let iom = RuntimeBuilder::new().workers(2).name("app").build()?;
//! iom.spawn(|| {
//!     unsafe { hook::sleep(1) }; // parks the fiber, not the thread
//!     println!("woke up");
//! });
//! iom.stop();
//! ```

mod builder;
pub mod config;
mod error;
pub mod fiber;
pub mod hook;
mod reactor;
mod runtime;
pub mod time;
mod utils;

pub use builder::RuntimeBuilder;
pub use config::Config;
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, EventCallback, IoManager};
pub use runtime::{Scheduler, Task};
pub use time::{Clock, ManualClock, SystemClock, TimerCallback, TimerHandle, TimerManager};
