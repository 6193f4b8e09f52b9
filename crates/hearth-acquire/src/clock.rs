//! Injectable time source.
//!
//! Everything time-dependent (clearance expiry, timers, rate-limit pauses)
//! reads the clock through this trait. The default implementation is backed
//! by `tokio::time`, so tests running under a paused runtime can advance time
//! without real delays.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic "now", used for deadlines.
    fn now(&self) -> Instant;

    /// Seconds since the Unix epoch, used to interpret cookie expiry.
    fn unix_now(&self) -> f64;
}

/// Clock backed by `tokio::time` and the system wall clock.
///
/// Wall time is derived from the monotonic clock relative to the moment the
/// clock was created, so a paused tokio runtime moves both together.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
    origin_unix: f64,
}

impl TokioClock {
    pub fn new() -> Self {
        let origin_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            origin: Instant::now(),
            origin_unix,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> f64 {
        self.origin_unix + self.now().duration_since(self.origin).as_secs_f64()
    }
}

/// Convert a Unix timestamp into a monotonic deadline relative to `clock`.
///
/// Timestamps in the past collapse to "now".
pub fn deadline_from_unix(clock: &dyn Clock, unix_secs: f64) -> Instant {
    let remaining = unix_secs - clock.unix_now();
    if remaining <= 0.0 || !remaining.is_finite() {
        return clock.now();
    }
    clock.now() + Duration::from_secs_f64(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wall_time_follows_paused_runtime() {
        let clock = TokioClock::new();
        let before = clock.unix_now();
        tokio::time::advance(Duration::from_secs(90)).await;
        let after = clock.unix_now();
        assert!((after - before - 90.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_from_unix_handles_past_and_future() {
        let clock = TokioClock::new();
        let now = clock.now();
        assert_eq!(deadline_from_unix(&clock, clock.unix_now() - 10.0), now);

        let future = deadline_from_unix(&clock, clock.unix_now() + 60.0);
        let delta = future.duration_since(now);
        assert!(delta >= Duration::from_secs(59) && delta <= Duration::from_secs(61));
    }
}
