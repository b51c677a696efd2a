//! Simple in-memory storage for recent messages
//!
//! A bounded ring of rendered lines. Nothing is written to disk unless
//! the history is explicitly exported.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{MessageStore, StoredMessage};
use crate::constants::DEFAULT_HISTORY_CAPACITY;
use crate::error::{ChatwireError, Result};

/// In-memory message history with a maximum capacity
pub struct MemoryMessageStore {
    messages: Mutex<VecDeque<StoredMessage>>,
    max_size: usize,
}

impl MemoryMessageStore {
    /// Create a message store with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a message store with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            max_size: capacity.max(1),
        }
    }

    /// Serialize the whole history as a JSON array
    pub fn export_json(&self) -> Result<String> {
        let messages = self.messages.lock()?;
        serde_json::to_string_pretty(&*messages)
            .map_err(|e| ChatwireError::StorageError(format!("Failed to export history: {}", e)))
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, rendered: &str) -> Result<()> {
        let mut messages = self.messages.lock()?;

        // If at capacity, remove the oldest message
        if messages.len() >= self.max_size {
            messages.pop_front();
        }
        messages.push_back(StoredMessage::new(rendered.to_string()));
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.lock()?;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.iter().skip(skip).cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.messages.lock()?.len())
    }
}

/// Thread-safe handle to a message store
pub type SharedMessageStore = Arc<dyn MessageStore>;

/// Create a new shared in-memory store with custom capacity
pub fn create_message_store_with_capacity(capacity: usize) -> Arc<MemoryMessageStore> {
    Arc::new(MemoryMessageStore::with_capacity(capacity))
}
