use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use log::warn;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChatwireError, Result};

/// Salted Argon2 hash of a password, in PHC string format
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ChatwireError::AuthError(format!("Failed to hash password: {}", e)))
}

/// A registered chat identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Login name, unique in the identity store
    pub username: String,
    pub password_hash: String,
    /// Registration timestamp
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl Participant {
    /// CPU heavy; async callers should run it on a blocking thread
    pub fn new(username: String, password: &str) -> Result<Self> {
        Ok(Self {
            username,
            password_hash: hash_password(password)?,
            joined_at: chrono::Utc::now(),
        })
    }

    pub fn verify_password(&self, password: &str) -> bool {
        match PasswordHash::new(&self.password_hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("Stored password hash for {} is malformed: {}", self.username, e);
                false
            }
        }
    }
}

/// A named grouping of participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Channel {
    pub fn new(name: String) -> Self {
        Self {
            name,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Identity of a participant as seen by a connection. Carries no ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantRef(pub String);

impl ParticipantRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a sender id
    pub fn matches_ignore_case(&self, name: &str) -> bool {
        self.0 == name || self.0.to_lowercase() == name.to_lowercase()
    }
}

impl fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a channel as seen by a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(pub String);

impl ChannelRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
