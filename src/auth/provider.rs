//! Identity store interface and its in-memory backend
//!
//! Connections only ever hold opaque references to participants and
//! channels; lookups, registration and password checks go through an
//! `IdentityStore`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::user::{Channel, Participant};
use crate::error::{ChatwireError, Result};

/// Trait for participant and channel backends
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Check whether a participant with this username is registered
    async fn has_participant(&self, username: &str) -> bool;

    /// Register a new participant. Fails if the username is taken.
    async fn register_participant(&self, participant: Participant) -> Result<()>;

    /// Check a username/password pair
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool>;

    /// All registered participants
    async fn participants(&self) -> Vec<Participant>;

    async fn has_channel(&self, name: &str) -> bool;

    /// Register a new channel. Fails if the name is taken.
    async fn register_channel(&self, channel: Channel) -> Result<()>;

    async fn channel(&self, name: &str) -> Option<Channel>;

    /// Get the backend name for logging/debugging
    fn backend_name(&self) -> &'static str;
}

/// In-memory identity store for development and testing
pub struct MemoryIdentityStore {
    participants: Arc<RwLock<HashMap<String, Participant>>>,
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            participants: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a store that already knows the given channel
    pub fn with_channel(name: &str) -> Self {
        let mut channels = HashMap::new();
        channels.insert(name.to_string(), Channel::new(name.to_string()));
        Self {
            participants: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(channels)),
        }
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn has_participant(&self, username: &str) -> bool {
        self.participants.read().await.contains_key(username)
    }

    async fn register_participant(&self, participant: Participant) -> Result<()> {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&participant.username) {
            return Err(ChatwireError::AlreadyExists(format!(
                "participant {}",
                participant.username
            )));
        }
        log::debug!("Registered participant {}", participant.username);
        participants.insert(participant.username.clone(), participant);
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let participant = self
            .participants
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| ChatwireError::NotFound(format!("participant {}", username)))?;

        let password = password.to_string();
        tokio::task::spawn_blocking(move || participant.verify_password(&password))
            .await
            .map_err(|e| ChatwireError::AuthError(format!("Password check failed: {}", e)))
    }

    async fn participants(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.participants.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    async fn has_channel(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    async fn register_channel(&self, channel: Channel) -> Result<()> {
        let mut channels = self.channels.write().await;
        if channels.contains_key(&channel.name) {
            return Err(ChatwireError::AlreadyExists(format!("channel {}", channel.name)));
        }
        channels.insert(channel.name.clone(), channel);
        Ok(())
    }

    async fn channel(&self, name: &str) -> Option<Channel> {
        self.channels.read().await.get(name).cloned()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
