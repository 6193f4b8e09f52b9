//! Clearance bookkeeping and challenge-page detection.

use super::browser::SessionCookie;
use crate::clock::{deadline_from_unix, Clock};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory record of the current clearance. Never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearanceState {
    pub ready: bool,
    pub issued_at: Option<Instant>,
    pub expires_at: Option<Instant>,
}

impl ClearanceState {
    pub fn granted(issued_at: Instant, expires_at: Instant) -> Self {
        Self {
            ready: true,
            issued_at: Some(issued_at),
            expires_at: Some(expires_at),
        }
    }

    /// Ready and not yet inside the renewal margin.
    pub fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        match (self.ready, self.expires_at) {
            (true, Some(expires_at)) => now + margin < expires_at,
            _ => false,
        }
    }

    /// Ready and not yet expired.
    pub fn is_valid(&self, now: Instant) -> bool {
        self.is_fresh(now, Duration::ZERO)
    }

    pub fn status(&self, now: Instant) -> ClearanceStatus {
        let valid = self.is_valid(now);
        let expires_in_seconds = match (valid, self.expires_at) {
            (true, Some(expires_at)) => expires_at.saturating_duration_since(now).as_secs(),
            _ => 0,
        };
        ClearanceStatus {
            valid,
            expires_in_seconds,
        }
    }
}

/// Externally visible clearance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearanceStatus {
    pub valid: bool,
    pub expires_in_seconds: u64,
}

/// What one poll of the challenge page observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeObservation {
    /// The clearance cookie is in the jar, with its expiry if it has one.
    Cleared { cookie_expires: Option<f64> },
    /// No challenge markers on the page: clearance was never required.
    NoChallenge,
    /// Still looking at a challenge page.
    Pending,
}

/// Decide what a poll observed from the jar and the page.
pub fn observe(
    cookies: &[SessionCookie],
    clearance_cookie: &str,
    title: &str,
    body: &str,
    markers: &[String],
) -> ChallengeObservation {
    if let Some(cookie) = cookies
        .iter()
        .find(|c| c.name == clearance_cookie && !c.value.is_empty())
    {
        return ChallengeObservation::Cleared {
            cookie_expires: cookie.expires,
        };
    }
    if looks_like_challenge(title, body, markers) {
        ChallengeObservation::Pending
    } else {
        ChallengeObservation::NoChallenge
    }
}

/// Whether the page title or body contains any challenge marker.
pub fn looks_like_challenge(title: &str, body: &str, markers: &[String]) -> bool {
    let title = title.to_ascii_lowercase();
    let body = body.to_ascii_lowercase();
    markers.iter().any(|m| {
        let m = m.to_ascii_lowercase();
        !m.is_empty() && (title.contains(&m) || body.contains(&m))
    })
}

/// Expiry deadline for a fresh clearance: the cookie's own expiry when it
/// has one in the future, else `now + default_window`.
pub fn derive_expiry(
    clock: &dyn Clock,
    cookie_expires: Option<f64>,
    default_window: Duration,
) -> Instant {
    let now = clock.now();
    match cookie_expires {
        Some(unix) if unix > clock.unix_now() => deadline_from_unix(clock, unix),
        _ => now + default_window,
    }
}
