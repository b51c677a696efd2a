//! Client connection management
//! Handles the lifecycle of a single accepted socket

use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::user::{ChannelRef, ParticipantRef};
use crate::constants::OUTBOUND_QUEUE_CAPACITY;
use crate::core::state::{ConnectionState, SharedState};
use crate::core::watchdog::IdleWatchdog;

/// Bytes queued for a connection's writer task
pub type Frame = Arc<[u8]>;

/// Resolves once the writer has fully written and flushed the frame.
/// Fails if the write failed or the connection shut down first.
pub type WriteAck = oneshot::Receiver<()>;

struct Outbound {
    frame: Frame,
    written: Option<oneshot::Sender<()>>,
}

/// Cheap, cloneable access to a live connection.
///
/// The session loop keeps one of these after the `Connection` itself has
/// moved into the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Arc<str>,
    state: SharedState,
    cancel: CancellationToken,
    activity: mpsc::Sender<()>,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Tell the watchdog the client is active. Never blocks; pending resets coalesce.
    pub fn touch(&self) {
        // A full channel already holds a reset the watchdog has not consumed yet
        let _ = self.activity.try_send(());
    }

    /// Queue bytes for the writer task without waiting for the write.
    ///
    /// Returns false once the connection is shutting down. A client that lets
    /// its queue fill up is closed.
    pub fn send(&self, frame: impl Into<Frame>) -> bool {
        self.enqueue(Outbound {
            frame: frame.into(),
            written: None,
        })
    }

    /// Queue bytes and get notified once they are on the wire
    pub fn send_tracked(&self, frame: impl Into<Frame>) -> Option<WriteAck> {
        let (tx, rx) = oneshot::channel();
        let queued = self.enqueue(Outbound {
            frame: frame.into(),
            written: Some(tx),
        });
        queued.then_some(rx)
    }

    fn enqueue(&self, outbound: Outbound) -> bool {
        if self.cancel.is_cancelled() {
            trace!("Dropping frame for cancelled connection {}", self.id);
            return false;
        }
        match self.outbound.try_send(outbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue of connection {} is full ({} frames), closing",
                    self.id, OUTBOUND_QUEUE_CAPACITY
                );
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Failed to queue message for connection {}", self.id);
                self.close();
                false
            }
        }
    }

    /// Explicit shutdown: mark Closed and cancel the read loop, watchdog and writer
    pub fn close(&self) {
        self.state.advance(ConnectionState::Closed);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been cancelled by anyone
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Represents the state of a single client connection
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    participant: Option<ParticipantRef>,
    channel: Option<ChannelRef>,
    idle_timeout: Duration,
    connected_at: Instant,
}

impl Connection {
    /// Take ownership of an accepted stream.
    ///
    /// Spawns the writer task (owning the write half) and the idle watchdog.
    /// The read half goes back to the caller, who runs the read loop. Must be
    /// called from within a tokio runtime.
    pub fn accept<S>(stream: S, peer: impl Into<String>, idle_timeout: Duration) -> (Self, ReadHalf<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id: Arc<str> = Arc::from(peer.into());
        let (reader, writer) = tokio::io::split(stream);

        let state = SharedState::new();
        let cancel = CancellationToken::new();
        let (activity_tx, activity_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        tokio::spawn(write_loop(
            id.clone(),
            writer,
            outbound_rx,
            state.clone(),
            cancel.clone(),
        ));
        IdleWatchdog::new(
            id.to_string(),
            idle_timeout,
            state.clone(),
            cancel.clone(),
            activity_rx,
        )
        .spawn();

        debug!("Accepted connection {} (idle timeout {:?})", id, idle_timeout);

        let connection = Self {
            handle: ConnectionHandle {
                id,
                state,
                cancel,
                activity: activity_tx,
                outbound: outbound_tx,
            },
            participant: None,
            channel: None,
            idle_timeout,
            connected_at: Instant::now(),
        };
        (connection, reader)
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn participant(&self) -> Option<&ParticipantRef> {
        self.participant.as_ref()
    }

    pub fn channel(&self) -> Option<&ChannelRef> {
        self.channel.as_ref()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn set_participant(&mut self, participant: ParticipantRef) {
        self.participant = Some(participant);
    }

    pub(crate) fn set_channel(&mut self, channel: ChannelRef) {
        self.channel = Some(channel);
    }

    /// Pending -> Connected. No effect on a connection that is already further along.
    pub(crate) fn mark_connected(&self) {
        self.handle.state.advance(ConnectionState::Connected);
    }

    pub fn touch(&self) {
        self.handle.touch()
    }

    pub fn send(&self, frame: impl Into<Frame>) -> bool {
        self.handle.send(frame)
    }

    pub fn send_tracked(&self, frame: impl Into<Frame>) -> Option<WriteAck> {
        self.handle.send_tracked(frame)
    }

    pub fn close(&self) {
        self.handle.close()
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Single writer per socket: drains the outbound queue until the queue
/// closes or the connection is cancelled, then shuts the write side down.
///
/// Frames queued before cancellation are still written, unless the peer
/// stops reading. A frame's acknowledgement fires only after a complete
/// write and flush.
async fn write_loop<S>(
    id: Arc<str>,
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    state: SharedState,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let Outbound { frame, written: ack } = tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let written = tokio::select! {
            biased;
            result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => result,
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = written {
            warn!("Write to connection {} failed: {}", id, e);
            state.advance(ConnectionState::Closed);
            cancel.cancel();
            break;
        }
        if let Some(ack) = ack {
            // The dispatcher may have stopped waiting
            let _ = ack.send(());
        }
    }

    // Stop accepting frames before the socket goes away
    outbound.close();
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection {} failed: {}", id, e);
    }
    trace!("Writer for connection {} finished", id);
}
