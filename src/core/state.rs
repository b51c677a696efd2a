//! Connection lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a single client connection.
///
/// Transitions only move forward: `Pending -> Connected -> Closed`.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Pending = 0,
    Connected = 1,
    Closed = 2,
}

impl ConnectionState {
    /// Presence label shown to other participants
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Pending => "offline",
            ConnectionState::Connected => "online",
            ConnectionState::Closed => "closed",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// State shared between a connection, its handles and its watchdog
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Pending as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Returns the previous state.
    ///
    /// A request to move backwards leaves the state untouched.
    pub(crate) fn advance(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.fetch_max(next as u8, Ordering::AcqRel))
    }
}
