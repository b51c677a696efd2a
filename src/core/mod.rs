//! Core functionality: connection lifecycle and message fan-out

pub mod connection;
pub mod message;
pub mod registry;
pub mod state;
pub mod watchdog;

// Re-export main components for convenience
pub use connection::{Connection, ConnectionHandle, Frame, WriteAck};
pub use message::{ChatMessage, Destination, MessageEnvelope, MessageKind, SystemMessage};
pub use registry::{create_registry, ConnectionRegistry, SharedRegistry};
pub use state::ConnectionState;
pub use watchdog::WatchdogExit;
