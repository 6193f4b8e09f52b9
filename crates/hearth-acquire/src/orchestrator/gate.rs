//! Shared rate-limit gate.
//!
//! When any worker sees a 429, the whole pool pauses: the gate records a
//! resume deadline and every worker waits it out before its next request.
//! Concurrent pauses never shorten each other.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct RateLimitGate {
    resume_at: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause every worker for `delay` from now, unless an equal or longer
    /// pause is already in effect. Returns the resulting resume deadline.
    pub fn pause(&self, delay: Duration) -> Instant {
        let requested = Instant::now() + delay;
        let mut resume_at = self.resume_at.lock();
        let deadline = match *resume_at {
            Some(current) if current >= requested => current,
            _ => requested,
        };
        *resume_at = Some(deadline);
        deadline
    }

    /// Resume deadline if a pause is still in effect.
    pub fn paused_until(&self) -> Option<Instant> {
        let resume_at = *self.resume_at.lock();
        resume_at.filter(|t| *t > Instant::now())
    }

    /// Sleep until no pause is in effect.
    ///
    /// Re-checks after waking, since another worker may have extended the
    /// pause meanwhile. Returns `false` if `token` was cancelled first.
    pub async fn wait(&self, token: &CancellationToken) -> bool {
        while let Some(deadline) = self.paused_until() {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        !token.is_cancelled()
    }
}
