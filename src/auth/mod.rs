//! Participant and channel identities

pub mod provider;
pub mod user;

// Re-export main components
pub use provider::{IdentityStore, MemoryIdentityStore};
pub use user::{Channel, ChannelRef, Participant, ParticipantRef};
