//! Per-connection inactivity watchdog
//!
//! Every connection gets one watchdog task. The task closes the connection
//! once `idle_timeout` elapses without a reset signal; each reset restarts
//! the full window.

use log::{debug, info, trace};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::state::{ConnectionState, SharedState};

/// Why a watchdog task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// The idle window elapsed; the watchdog closed the connection
    TimedOut,
    /// Someone else cancelled the connection first
    Cancelled,
    /// Every reset sender was dropped
    Detached,
}

pub(crate) struct IdleWatchdog {
    connection_id: String,
    idle_timeout: Duration,
    state: SharedState,
    cancel: CancellationToken,
    resets: mpsc::Receiver<()>,
}

impl IdleWatchdog {
    pub(crate) fn new(
        connection_id: String,
        idle_timeout: Duration,
        state: SharedState,
        cancel: CancellationToken,
        resets: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            connection_id,
            idle_timeout,
            state,
            cancel,
            resets,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<WatchdogExit> {
        tokio::spawn(self.run())
    }

    pub(crate) async fn run(mut self) -> WatchdogExit {
        let deadline = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(deadline);

        loop {
            // Cancellation wins over everything, and a reset that lands together
            // with the deadline still counts as activity.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    trace!("Watchdog for {} stopped by cancellation", self.connection_id);
                    return WatchdogExit::Cancelled;
                }
                signal = self.resets.recv() => match signal {
                    Some(()) => {
                        deadline.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                    None => {
                        debug!("Watchdog for {} detached", self.connection_id);
                        return WatchdogExit::Detached;
                    }
                },
                _ = &mut deadline => {
                    info!(
                        "Connection {} idle for {:?}, closing",
                        self.connection_id, self.idle_timeout
                    );
                    self.state.advance(ConnectionState::Closed);
                    self.cancel.cancel();
                    return WatchdogExit::TimedOut;
                }
            }
        }
    }
}
