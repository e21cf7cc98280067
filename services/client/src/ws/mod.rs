//! Channel Session Management
//!
//! This module contains the logic for the persistent channel to the
//! generation service. It is structured into submodules for clarity:
//!
//! - `protocol`: The JSON envelope exchanged with the service and its payloads.
//! - `registry`: Durable, multi-subscriber event handlers.
//! - `backoff`: The reconnection delay schedule.
//! - `transport`: How a physical link is opened (WebSocket or in-process).
//! - `connection`: The connection lifecycle, from handshake to reconnection.
//! - `correlator`: Awaitable request/response calls on top of one-way frames.

pub mod backoff;
pub mod connection;
pub mod correlator;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, Identity, WeakConnectionManager};
pub use correlator::{Correlator, PendingReply};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
