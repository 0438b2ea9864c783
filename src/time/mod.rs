//! Timers ordered by expiry.
//!
//! - [`TimerManager`] owns the ordered set and hands out expired callbacks
//! - [`TimerHandle`] cancels, refreshes or resets a pending timer
//! - [`Clock`] abstracts "now"; [`ManualClock`] makes tests deterministic
//!
//! # Example
//!
//! ```ignore
//! use fiberio::time::{ManualClock, TimerManager};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let timers = TimerManager::with_clock(clock.clone());
//! timers.add_timer(50, || println!("fired"), false);
//!
//! clock.advance(50);
//! for cb in timers.list_expired() {
//!     cb();
//! }
//! ```

pub mod clock;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use timer::{TimerCallback, TimerHandle, TimerManager};
