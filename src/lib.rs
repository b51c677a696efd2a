//! chatwire - connection lifecycle and message fan-out for a line-oriented chat server
//!
//! This library tracks every client connection from accept to close,
//! enforces an inactivity timeout per connection, and delivers chat and
//! system messages to the right set of connected participants.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod security;
pub mod storage;

// Re-export main components
pub use config::*;
pub use constants::*;
