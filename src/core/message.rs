//! Outbound message envelopes and their line rendering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SENDER_COLUMN_WIDTH;

/// Sender id reported for server-originated messages
pub const SYSTEM_SENDER: &str = "system";

/// Where a message goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "recipient")]
pub enum Destination {
    /// A single connection, by connection id
    Directed(String),
    /// Every connected participant
    BroadcastAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    System,
}

/// Clock format used in every rendered line
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%H:%M:%S").to_string()
}

/// Render one line of chat output.
///
/// Without a sender the line is session-owned (`HH:MM:SS: text`), otherwise
/// the sender is right-justified in a fixed-width column.
pub fn render_line(time: &DateTime<Utc>, sender: Option<&str>, payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    match sender {
        None => format!("{}: {}", format_time(time), text),
        Some(sender) => format!(
            "{}: [{:>width$}]: {}",
            format_time(time),
            sender,
            text,
            width = SENDER_COLUMN_WIDTH
        ),
    }
}

/// A line typed by a participant, relayed to everybody else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    sender: String,
    payload: Vec<u8>,
    sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::at(sender, payload, Utc::now())
    }

    /// Build a message with an explicit timestamp
    pub fn at(sender: impl Into<String>, payload: impl Into<Vec<u8>>, sent_at: DateTime<Utc>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
            sent_at,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// Canonical relayed form, without the line terminator
    pub fn render(&self) -> String {
        render_line(&self.sent_at, Some(&self.sender), &self.payload)
    }
}

/// A server-originated notice, written to recipients verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    payload: Vec<u8>,
    sent_at: DateTime<Utc>,
    destination: Destination,
}

impl SystemMessage {
    pub fn new(payload: impl Into<Vec<u8>>, destination: Destination) -> Self {
        Self {
            payload: payload.into(),
            sent_at: Utc::now(),
            destination,
        }
    }

    pub fn directed(recipient: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload, Destination::Directed(recipient.into()))
    }

    pub fn broadcast(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload, Destination::BroadcastAll)
    }

    /// A session-owned notice: stamped with the current time, newline terminated
    pub fn announcement(text: &str, destination: Destination) -> Self {
        let sent_at = Utc::now();
        let mut line = render_line(&sent_at, None, text.as_bytes());
        line.push('\n');
        Self {
            payload: line.into_bytes(),
            sent_at,
            destination,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// One outbound message. Each kind carries only the fields its delivery rule needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEnvelope {
    Chat(ChatMessage),
    System(SystemMessage),
}

impl MessageEnvelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageEnvelope::Chat(_) => MessageKind::Chat,
            MessageEnvelope::System(_) => MessageKind::System,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            MessageEnvelope::Chat(msg) => msg.sender(),
            MessageEnvelope::System(_) => SYSTEM_SENDER,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            MessageEnvelope::Chat(msg) => msg.payload(),
            MessageEnvelope::System(msg) => msg.payload(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MessageEnvelope::Chat(msg) => msg.sent_at(),
            MessageEnvelope::System(msg) => msg.sent_at(),
        }
    }

    /// Chat messages are always broadcast
    pub fn destination(&self) -> Destination {
        match self {
            MessageEnvelope::Chat(_) => Destination::BroadcastAll,
            MessageEnvelope::System(msg) => msg.destination().clone(),
        }
    }

    /// Exact bytes written to each recipient
    pub fn frame(&self) -> Vec<u8> {
        match self {
            MessageEnvelope::Chat(msg) => {
                let mut line = msg.render();
                line.push('\n');
                line.into_bytes()
            }
            MessageEnvelope::System(msg) => msg.payload().to_vec(),
        }
    }
}

impl From<ChatMessage> for MessageEnvelope {
    fn from(msg: ChatMessage) -> Self {
        MessageEnvelope::Chat(msg)
    }
}

impl From<SystemMessage> for MessageEnvelope {
    fn from(msg: SystemMessage) -> Self {
        MessageEnvelope::System(msg)
    }
}
