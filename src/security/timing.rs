//! Timing-safe helpers for the login handshake

use std::time::Duration;
use tokio::time::Instant;

/// Pads a login attempt to a fixed minimum duration, so a failed lookup and
/// a failed password check cannot be told apart by response time.
pub struct AuthTimer {
    start: Instant,
    min_duration: Duration,
}

impl AuthTimer {
    pub fn start(min_duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            min_duration,
        }
    }

    /// Sleep for whatever is left of the minimum duration
    pub async fn wait(self) {
        let elapsed = self.start.elapsed();
        if elapsed < self.min_duration {
            tokio::time::sleep(self.min_duration - elapsed).await;
        }
    }
}
