//! Epoll-based I/O reactor.
//!
//! - [`core`]: [`IoManager`], the scheduler whose idle fibers poll epoll
//! - [`event`]: the epoll wrapper and the [`Event`] direction type
//! - [`fd_context`]: per-descriptor waiters

pub mod core;
pub mod event;
pub(crate) mod fd_context;

pub use self::core::IoManager;
pub use event::Event;
pub use fd_context::EventCallback;
