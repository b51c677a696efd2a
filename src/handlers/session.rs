//! Per-client session: login handshake, read loop and teardown

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::auth::provider::IdentityStore;
use crate::auth::user::{ChannelRef, Participant, ParticipantRef};
use crate::config::ServerConfig;
use crate::constants::{MAX_LOGIN_ATTEMPTS, MIN_AUTH_DURATION_MS};
use crate::core::connection::{Connection, ConnectionHandle};
use crate::core::message::{ChatMessage, Destination, SystemMessage};
use crate::core::registry::SharedRegistry;
use crate::core::state::ConnectionState;
use crate::error::{ChatwireError, Result};
use crate::security::timing::AuthTimer;
use crate::storage::SharedMessageStore;

/// Everything a session needs from the rest of the server
#[derive(Clone)]
pub struct SessionContext {
    pub registry: SharedRegistry,
    pub identity: Arc<dyn IdentityStore>,
    pub history: SharedMessageStore,
    pub config: Arc<ServerConfig>,
}

enum Inbound {
    Line(String),
    TooLong,
    Closed,
}

// Handle one accepted client until it quits, times out or the server shuts down
pub async fn handle_client<S>(stream: S, peer: String, ctx: SessionContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (connection, reader) = Connection::accept(stream, peer, ctx.config.idle_timeout);
    let handle = connection.handle();
    let id = handle.id().to_string();

    if let Err(e) = ctx.registry.add(connection).await {
        error!("Failed to register connection {}: {}", id, e);
        handle.close();
        return;
    }
    info!("Client connected: {} ({} connections)", id, ctx.registry.len().await);

    let mut reader = BufReader::new(reader);

    let username = match login(&mut reader, &handle, &ctx).await {
        Ok(username) => username,
        Err(e) => {
            warn!("Login on {} aborted: {}", id, e);
            None
        }
    };

    if let Some(ref username) = username {
        if let Err(e) = chat_loop(&mut reader, &handle, username, &ctx).await {
            debug!("Session {} ended with error: {}", id, e);
        }
    }

    handle.close();
    match ctx.registry.remove(&id).await {
        Ok(connection) => info!(
            "Client disconnected: {} after {:?}",
            id,
            connection.connection_duration()
        ),
        Err(e) => error!("Error unregistering connection {}: {}", id, e),
    }

    if let Some(username) = username {
        let notice = SystemMessage::announcement(&format!("{} left", username), Destination::BroadcastAll);
        let count = ctx.registry.dispatch(&notice.into()).await;
        debug!("Broadcast leave notice for {} to {} participants", username, count);
    }
}

/// Write a session-owned line to this client only, whatever its state
fn notify(handle: &ConnectionHandle, text: &str) -> bool {
    let notice = SystemMessage::announcement(text, Destination::Directed(handle.id().to_string()));
    handle.send(notice.payload().to_vec())
}

async fn next_line<R>(
    reader: &mut BufReader<R>,
    handle: &ConnectionHandle,
    max_line_length: usize,
) -> Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(max_line_length as u64 + 1);

    let read = tokio::select! {
        _ = handle.cancelled() => return Ok(Inbound::Closed),
        read = limited.read_until(b'\n', &mut buf) => read?,
    };

    if read == 0 {
        return Ok(Inbound::Closed);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max_line_length {
        return Ok(Inbound::TooLong);
    }

    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Inbound::Line(String::from_utf8_lossy(&buf).into_owned()))
}

async fn check_credentials(username: &str, password: &str, ctx: &SessionContext) -> Result<bool> {
    if ctx.identity.has_participant(username).await {
        return ctx.identity.authenticate(username, password).await;
    }

    // First login registers the participant
    let (name, secret) = (username.to_string(), password.to_string());
    let participant = tokio::task::spawn_blocking(move || Participant::new(name, &secret))
        .await
        .map_err(|e| ChatwireError::AuthError(format!("Password hashing failed: {}", e)))??;
    ctx.identity.register_participant(participant).await?;
    info!("Registered new participant {}", username);
    Ok(true)
}

/// Run the handshake. Returns the username once the connection is Connected.
async fn login<R>(
    reader: &mut BufReader<R>,
    handle: &ConnectionHandle,
    ctx: &SessionContext,
) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    notify(handle, "Welcome! Enter <username> <password>");

    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let line = match next_line(reader, handle, ctx.config.max_line_length).await? {
            Inbound::Line(line) => line,
            Inbound::TooLong => {
                notify(handle, "Line too long");
                return Ok(None);
            }
            Inbound::Closed => return Ok(None),
        };
        handle.touch();

        let mut parts = line.split_whitespace();
        let (username, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(username), Some(password), None) => (username, password),
            _ => {
                notify(handle, "Expected <username> <password>");
                continue;
            }
        };

        let timer = AuthTimer::start(Duration::from_millis(MIN_AUTH_DURATION_MS));
        let accepted = check_credentials(username, password, ctx).await;
        timer.wait().await;

        match accepted {
            Ok(true) => {}
            Ok(false) => {
                warn!("Authentication failed for {} on {}", username, handle.id());
                notify(handle, "Authentication failed");
                continue;
            }
            Err(e) => {
                warn!("Authentication error for {} on {}: {}", username, handle.id(), e);
                notify(handle, "Authentication failed");
                continue;
            }
        }

        let participant = ParticipantRef(username.to_string());
        let channel = ChannelRef(ctx.config.default_channel.clone());
        // Refused while another session is Connected as the same participant
        if !ctx.registry.connect_as(handle.id(), participant, channel).await? {
            notify(handle, &format!("{} is already connected", username));
            continue;
        }

        info!("{} logged in on {}", username, handle.id());
        return Ok(Some(username.to_string()));
    }

    notify(handle, "Too many failed attempts");
    Ok(None)
}

async fn list_participants(handle: &ConnectionHandle, ctx: &SessionContext) {
    let mut entries = Vec::new();
    for participant in ctx.identity.participants().await {
        // Registered but not logged in reads as offline
        let state = if ctx.registry.has_connected_participant(&participant.username).await {
            ConnectionState::Connected
        } else {
            ConnectionState::Pending
        };
        entries.push(format!("{} ({})", participant.username, state.label()));
    }
    notify(handle, &format!("Participants: {}", entries.join(", ")));
}

async fn chat_loop<R>(
    reader: &mut BufReader<R>,
    handle: &ConnectionHandle,
    username: &str,
    ctx: &SessionContext,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let welcome = SystemMessage::announcement(
        &format!("Logged in as {}. Commands: /who, /quit", username),
        Destination::Directed(handle.id().to_string()),
    );
    ctx.registry.dispatch(&welcome.into()).await;

    let recent = ctx
        .history
        .recent(ctx.config.history_replay)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to get recent messages: {}", e);
            Vec::new()
        });
    for message in recent {
        handle.send(format!("{}\n", message.rendered).into_bytes());
    }

    let joined = SystemMessage::announcement(&format!("{} joined", username), Destination::BroadcastAll);
    ctx.registry.dispatch(&joined.into()).await;

    loop {
        let line = match next_line(reader, handle, ctx.config.max_line_length).await? {
            Inbound::Line(line) => line,
            Inbound::TooLong => {
                notify(handle, "Line too long");
                break;
            }
            Inbound::Closed => break,
        };
        handle.touch();

        let text = line.trim();
        match text {
            "" => continue,
            "/quit" => {
                notify(handle, "Bye");
                break;
            }
            "/who" => {
                list_participants(handle, ctx).await;
                continue;
            }
            _ => {}
        }

        let message = ChatMessage::new(username, text);
        let rendered = message.render();
        let delivered = ctx.registry.dispatch(&message.into()).await;
        debug!("Chat from {} delivered to {} participants", username, delivered);

        // History is best effort and never holds up delivery
        if let Err(e) = ctx.history.store(&rendered).await {
            warn!("Failed to store message from {}: {}", username, e);
        }
    }

    Ok(())
}
