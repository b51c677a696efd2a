//! Handlers driving accepted client connections

pub mod session;

// Re-export the session handler
pub use session::{handle_client, SessionContext};
