//! Abstract storage interface for message history
//!
//! Dispatch hands every rendered chat line to a `MessageStore` after
//! delivery. A failing store never blocks or undoes delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata for stored messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// The line exactly as it was delivered, without terminator
    pub rendered: String,
    pub stored_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(rendered: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rendered,
            stored_at: Utc::now(),
        }
    }
}

/// Message history interface
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a rendered message
    async fn store(&self, rendered: &str) -> Result<()>;

    /// Most recent messages, oldest first
    async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Number of stored messages
    async fn count(&self) -> Result<usize>;
}
