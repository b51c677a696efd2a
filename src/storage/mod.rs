//! Message history storage

pub mod message_store;
pub mod traits;

// Re-export the message store
pub use message_store::{create_message_store_with_capacity, MemoryMessageStore, SharedMessageStore};
pub use traits::{MessageStore, StoredMessage};
