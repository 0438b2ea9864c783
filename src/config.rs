//! Process-wide runtime tunables.
//!
//! A single [`Config`] value serves as the process-wide default. It starts
//! from [`Config::default`] and can be replaced with [`set`]. Schedulers copy
//! it when created, so a change only affects runtimes created afterwards.
//! [`RuntimeBuilder`](crate::RuntimeBuilder) and the `with_config`
//! constructors give a runtime its own copy without touching the global one.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::config::{self, Config};
//!
//! config::set(Config::from_env());
//! assert!(config::get().stack_size > 0);
//! ```

use parking_lot::RwLock;
use std::env;
use std::str::FromStr;

/// Default fiber stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Default timeout applied by the hooked `connect`, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default upper bound on a single `epoll_wait`, in milliseconds.
pub const DEFAULT_MAX_POLL_TIMEOUT_MS: u64 = 3000;

/// Default number of events fetched per `epoll_wait`.
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Tunables consulted by fibers, the reactor and the hook layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Stack size for fibers created with a stack size of `0`.
    pub stack_size: usize,

    /// Timeout used by [`hook::connect`](crate::hook::connect).
    pub connect_timeout_ms: u64,

    /// Cap on how long the reactor sleeps in `epoll_wait`, so a far-away
    /// timer never delays event processing.
    pub max_poll_timeout_ms: u64,

    /// Size of the event buffer handed to `epoll_wait`.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_poll_timeout_ms: DEFAULT_MAX_POLL_TIMEOUT_MS,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl Config {
    /// Builds a configuration from the defaults plus environment overrides.
    ///
    /// Recognised variables:
    /// - `FIBERIO_STACK_SIZE`
    /// - `FIBERIO_CONNECT_TIMEOUT_MS`
    /// - `FIBERIO_MAX_POLL_TIMEOUT_MS`
    /// - `FIBERIO_MAX_EVENTS`
    ///
    /// Malformed or zero values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_var("FIBERIO_STACK_SIZE") {
            config.stack_size = v;
        }
        if let Some(v) = read_var("FIBERIO_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = read_var("FIBERIO_MAX_POLL_TIMEOUT_MS") {
            config.max_poll_timeout_ms = v;
        }
        if let Some(v) = read_var("FIBERIO_MAX_EVENTS") {
            config.max_events = v;
        }

        config
    }
}

fn read_var<T>(name: &str) -> Option<T>
where
    T: FromStr + PartialEq + Default,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) if v != T::default() => Some(v),
        _ => {
            log::warn!("ignoring invalid value {raw:?} for {name}");
            None
        }
    }
}

static GLOBAL: RwLock<Config> = RwLock::new(Config {
    stack_size: DEFAULT_STACK_SIZE,
    connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
    max_poll_timeout_ms: DEFAULT_MAX_POLL_TIMEOUT_MS,
    max_events: DEFAULT_MAX_EVENTS,
});

/// Returns a copy of the current process-wide configuration.
pub fn get() -> Config {
    *GLOBAL.read()
}

/// Replaces the process-wide configuration.
pub fn set(config: Config) {
    *GLOBAL.write() = config;
}

/// Applies `f` to the process-wide configuration in place.
pub fn update(f: impl FnOnce(&mut Config)) {
    f(&mut GLOBAL.write());
}
