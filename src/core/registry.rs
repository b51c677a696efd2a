//! Registry of live connections and the message fan-out algorithm

use futures_util::future::join_all;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::auth::user::{ChannelRef, ParticipantRef};
use crate::constants::DEFAULT_WRITE_TIMEOUT_MS;
use crate::core::connection::{Connection, Frame, WriteAck};
use crate::core::message::{Destination, MessageEnvelope};
use crate::core::state::ConnectionState;
use crate::error::{ChatwireError, Result};

fn missing(id: &str) -> ChatwireError {
    error!("Connection {} doesn't exist", id);
    ChatwireError::Invariant(format!("connection {} doesn't exist", id))
}

/// All live connections, keyed by remote endpoint.
///
/// Lookups and dispatch share the read lock; structural changes and state
/// mutation take the write lock, so no connection is added or removed while
/// a dispatch is in flight.
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, Connection>>,
    write_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_write_timeout(Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS))
    }

    /// A recipient that cannot take a frame within `write_timeout` is
    /// left out of the delivered count and closed.
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            write_timeout,
        }
    }

    /// Register a freshly accepted connection
    pub async fn add(&self, connection: Connection) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(connection.id()) {
            error!("Connection {} is already registered", connection.id());
            return Err(ChatwireError::Invariant(format!(
                "connection {} is already registered",
                connection.id()
            )));
        }
        debug!("Registered connection {}", connection.id());
        entries.insert(connection.id().to_string(), connection);
        Ok(())
    }

    /// Remove a connection and hand it back to the caller
    pub async fn remove(&self, id: &str) -> Result<Connection> {
        let mut entries = self.entries.write().await;
        let connection = entries.remove(id).ok_or_else(|| missing(id))?;
        debug!("Unregistered connection {} ({})", id, connection.state());
        Ok(connection)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn state_of(&self, id: &str) -> Option<ConnectionState> {
        self.entries.read().await.get(id).map(|c| c.state())
    }

    /// True if some Connected entry is logged in as `username` (exact match)
    pub async fn has_connected_participant(&self, username: &str) -> bool {
        let entries = self.entries.read().await;
        entries.values().any(|conn| {
            conn.state() == ConnectionState::Connected
                && conn.participant().map(|p| p.as_str() == username).unwrap_or(false)
        })
    }

    /// Pending -> Connected
    pub async fn mark_connected(&self, id: &str) -> Result<()> {
        let entries = self.entries.write().await;
        let connection = entries.get(id).ok_or_else(|| missing(id))?;
        connection.mark_connected();
        Ok(())
    }

    pub async fn bind_participant(&self, id: &str, participant: ParticipantRef) -> Result<()> {
        let mut entries = self.entries.write().await;
        let connection = entries.get_mut(id).ok_or_else(|| missing(id))?;
        connection.set_participant(participant);
        Ok(())
    }

    pub async fn bind_channel(&self, id: &str, channel: ChannelRef) -> Result<()> {
        let mut entries = self.entries.write().await;
        let connection = entries.get_mut(id).ok_or_else(|| missing(id))?;
        connection.set_channel(channel);
        Ok(())
    }

    /// Bind identity and mark Connected in one step, unless another Connected
    /// entry already holds the same participant. Returns false in that case.
    pub async fn connect_as(
        &self,
        id: &str,
        participant: ParticipantRef,
        channel: ChannelRef,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(id) {
            return Err(missing(id));
        }

        let taken = entries.iter().any(|(other_id, conn)| {
            other_id != id
                && conn.state() == ConnectionState::Connected
                && conn.participant() == Some(&participant)
        });
        if taken {
            return Ok(false);
        }

        let connection = entries.get_mut(id).ok_or_else(|| missing(id))?;
        connection.set_participant(participant);
        connection.set_channel(channel);
        connection.mark_connected();
        Ok(true)
    }

    /// Current connection count
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Cancel every connection. Their sessions remove themselves afterwards.
    pub async fn shutdown_all(&self) -> usize {
        let entries = self.entries.read().await;
        for connection in entries.values() {
            connection.close();
        }
        entries.len()
    }

    /// Deliver one envelope to the recipients its kind and destination imply.
    ///
    /// Returns the number of recipients that got the whole frame written and
    /// flushed. A failed, stalled or slow recipient is logged and left out of
    /// the count; it never aborts the rest of the fan-out. The read lock is
    /// held until every write has settled, so membership cannot change under
    /// a dispatch in flight.
    pub async fn dispatch(&self, envelope: &MessageEnvelope) -> usize {
        let entries = self.entries.read().await;
        let frame: Frame = envelope.frame().into();

        let recipients: Vec<&Connection> = match envelope {
            MessageEnvelope::Chat(msg) => {
                // Only the first entry matching the sender is skipped
                let mut sender_skipped = false;
                entries
                    .values()
                    .filter(|c| c.state() == ConnectionState::Connected)
                    .filter(|c| {
                        let is_sender = !sender_skipped
                            && c.participant()
                                .map(|p| p.matches_ignore_case(msg.sender()))
                                .unwrap_or(false);
                        sender_skipped |= is_sender;
                        !is_sender
                    })
                    .collect()
            }
            MessageEnvelope::System(msg) => match msg.destination() {
                Destination::Directed(recipient) => match entries.get(recipient) {
                    Some(connection) if connection.state() == ConnectionState::Connected => {
                        vec![connection]
                    }
                    Some(connection) => {
                        debug!(
                            "Skipping system message to {} connection {}",
                            connection.state(),
                            recipient
                        );
                        Vec::new()
                    }
                    None => {
                        trace!("System message recipient {} is gone", recipient);
                        Vec::new()
                    }
                },
                Destination::BroadcastAll => entries
                    .values()
                    .filter(|c| c.state() == ConnectionState::Connected)
                    .collect(),
            },
        };

        let writes = recipients
            .into_iter()
            .filter_map(|connection| deliver(connection, &frame).map(|ack| (connection, ack)))
            .map(|(connection, ack)| self.settle(connection, ack));
        let delivered = join_all(writes).await.into_iter().filter(|ok| *ok).count();

        trace!(
            "{:?} message from {} delivered to {} connections",
            envelope.kind(),
            envelope.sender(),
            delivered
        );
        delivered
    }

    /// Wait for one recipient's write. A recipient too slow to take it is closed.
    async fn settle(&self, connection: &Connection, ack: WriteAck) -> bool {
        match tokio::time::timeout(self.write_timeout, ack).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!("Write to connection {} did not complete", connection.id());
                false
            }
            Err(_) => {
                warn!(
                    "Connection {} did not take a write within {:?}, closing",
                    connection.id(),
                    self.write_timeout
                );
                connection.close();
                false
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(connection: &Connection, frame: &Frame) -> Option<WriteAck> {
    let ack = connection.send_tracked(frame.clone());
    if ack.is_none() {
        warn!(
            "Failed to deliver message to connection {} ({})",
            connection.id(),
            connection
                .participant()
                .map(|p| p.as_str())
                .unwrap_or("anonymous")
        );
    }
    ack
}

// Shared reference to the registry
pub type SharedRegistry = Arc<ConnectionRegistry>;

pub fn create_registry() -> SharedRegistry {
    Arc::new(ConnectionRegistry::new())
}
