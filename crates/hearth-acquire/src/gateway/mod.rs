//! Session gateway: earns clearance past the anti-automation challenge with a
//! real browser, keeps it fresh, and performs identity-scoped fetches from
//! inside that browser.
//!
//! ## Serialization
//!
//! The browser and its single cookie jar live behind one FIFO
//! `tokio::sync::Mutex` (the session lock). Every fetch and every solve takes
//! it, so calls for different identities never interleave and the jar always
//! belongs to whoever holds the lock.
//!
//! ## Lifecycle
//!
//! The browser is launched lazily, health-probed before reuse, closed after
//! an idle window, and recycled after a configured number of fetches. Idle
//! close and recycling snapshot the jar and restore it into the next browser,
//! so neither identity nor clearance is lost.

pub mod browser;
pub mod chromium;
pub mod clearance;

use crate::clock::{Clock, TokioClock};
use crate::config::GatewayConfig;
use crate::error::{AcquireError, AcquireResult};
use crate::flight::SingleFlight;
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::schedule::ScheduledTask;
use browser::{BrowserDriver, BrowserSession, GatewayResponse, Identity, SessionCookie};
use clearance::{derive_expiry, observe, ChallengeObservation, ClearanceState, ClearanceStatus};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters describing the gateway's activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub launches: u64,
    pub solves: u64,
    pub fetches: u64,
    pub recycles: u64,
}

#[derive(Default)]
struct Counters {
    launches: AtomicU64,
    solves: AtomicU64,
    fetches: AtomicU64,
    recycles: AtomicU64,
}

/// Everything guarded by the session lock.
#[derive(Default)]
struct SessionSlot {
    browser: Option<Box<dyn BrowserSession>>,
    /// Identity whose cookies are currently in the jar.
    identity: Option<Identity>,
    /// Jar snapshot restored into the next browser after a relaunch.
    jar: Vec<SessionCookie>,
    fetches_since_launch: u64,
    last_used: Option<Instant>,
}

struct Inner {
    config: GatewayConfig,
    driver: Arc<dyn BrowserDriver>,
    clock: Arc<dyn Clock>,
    clearance: RwLock<ClearanceState>,
    session: Mutex<SessionSlot>,
    solves: SingleFlight<(), AcquireResult<()>>,
    renewal: ScheduledTask,
    idle: ScheduledTask,
    token: CancellationToken,
    counters: Counters,
}

/// Browser-backed gateway to the challenge-protected service.
///
/// Cheap to clone; clones share the same browser and clearance.
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<Inner>,
}

impl SessionGateway {
    /// Create a gateway that launches browsers through `driver`.
    pub fn new(config: GatewayConfig, driver: Arc<dyn BrowserDriver>) -> Self {
        Self::with_clock(config, driver, Arc::new(TokioClock::new()))
    }

    /// Create a gateway with an explicit clock.
    pub fn with_clock(
        config: GatewayConfig,
        driver: Arc<dyn BrowserDriver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                clock,
                clearance: RwLock::new(ClearanceState::default()),
                session: Mutex::new(SessionSlot::default()),
                solves: SingleFlight::new(),
                renewal: ScheduledTask::new("clearance-renewal"),
                idle: ScheduledTask::new("browser-idle"),
                token: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Create a gateway backed by a local Chromium install.
    pub fn chromium(config: GatewayConfig) -> AcquireResult<Self> {
        let driver = chromium::ChromiumDriver::new(&config)?;
        Ok(Self::new(config, Arc::new(driver)))
    }

    /// Make sure clearance is valid and outside its renewal margin, solving
    /// the challenge if it is not.
    ///
    /// Concurrent callers share a single in-flight solve and all observe its
    /// outcome.
    pub async fn ensure_ready(&self) -> AcquireResult<()> {
        self.inner.ensure_ready().await
    }

    /// Fetch `url` from inside the browser as `identity`.
    ///
    /// Returns the raw response whatever its status. A 401/403 here means
    /// the identity or session is bad, not the clearance, so it never
    /// triggers another solve; callers that keep seeing it should
    /// [`invalidate`](Self::invalidate).
    pub async fn fetch_as(&self, identity: &Identity, url: &str) -> AcquireResult<GatewayResponse> {
        self.inner.ensure_ready().await?;
        self.inner.fetch_locked(identity, url).await
    }

    /// Current clearance status. Pure read.
    pub fn status(&self) -> ClearanceStatus {
        self.inner.clearance.read().status(self.inner.clock.now())
    }

    /// Force clearance to not-ready; the next call solves again.
    pub fn invalidate(&self) {
        *self.inner.clearance.write() = ClearanceState::default();
        self.inner.renewal.cancel();
        info!("clearance invalidated");
    }

    /// Activity counters.
    pub fn stats(&self) -> GatewayStats {
        let c = &self.inner.counters;
        GatewayStats {
            launches: c.launches.load(Ordering::Relaxed),
            solves: c.solves.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            recycles: c.recycles.load(Ordering::Relaxed),
        }
    }

    /// Whether a browser process is currently alive.
    pub async fn has_browser(&self) -> bool {
        self.inner.session.lock().await.browser.is_some()
    }

    /// Deadline of the pending renewal timer, if any.
    pub fn renewal_deadline(&self) -> Option<Instant> {
        self.inner.renewal.deadline()
    }

    /// Stop timers, abort in-flight work and close the browser. Every later
    /// call fails with `Cancelled`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.token.cancel();
        inner.renewal.cancel();
        inner.idle.cancel();
        *inner.clearance.write() = ClearanceState::default();

        let mut slot = inner.session.lock().await;
        inner.teardown(&mut slot, false).await;
        slot.identity = None;
        slot.jar.clear();
        info!("session gateway shut down");
    }
}

impl Inner {
    fn is_fresh(&self) -> bool {
        self.clearance
            .read()
            .is_fresh(self.clock.now(), self.config.renewal_margin())
    }

    async fn ensure_ready(self: &Arc<Self>) -> AcquireResult<()> {
        if self.token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        if self.is_fresh() {
            return Ok(());
        }

        let inner = Arc::clone(self);
        let (result, leader) = self
            .solves
            .run((), move || async move { inner.solve().await })
            .await;
        if !leader {
            debug!("joined in-flight challenge solve");
        }
        result
    }

    async fn solve(self: Arc<Self>) -> AcquireResult<()> {
        info!(origin = %self.config.origin, "solving challenge");
        let started = self.clock.now();

        let mut slot = tokio::select! {
            _ = self.token.cancelled() => return Err(AcquireError::Cancelled),
            slot = self.session.lock() => slot,
        };

        // Another path may have refreshed clearance while we queued.
        if self.is_fresh() {
            return Ok(());
        }
        self.counters.solves.fetch_add(1, Ordering::Relaxed);
        self.ensure_browser(&mut slot).await?;
        // The site accepts a cookie that is still valid without issuing a new
        // one, so a renewal has to start from a jar without it.
        self.forget_clearance_cookie(&mut slot).await;

        let timeout = self.config.challenge_timeout();
        let observation = tokio::select! {
            _ = self.token.cancelled() => Err(AcquireError::Cancelled),
            polled = tokio::time::timeout(timeout, self.poll_challenge(&mut slot)) => {
                polled.unwrap_or(Err(AcquireError::ChallengeTimeout(timeout)))
            }
        };

        let cookie_expires = match observation {
            Ok(ChallengeObservation::Cleared { cookie_expires }) => cookie_expires,
            Ok(_) => None,
            Err(e) => {
                *self.clearance.write() = ClearanceState::default();
                warn!(error = %e, "challenge solve failed");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let expires_at = derive_expiry(&*self.clock, cookie_expires, self.config.default_clearance());
        *self.clearance.write() = ClearanceState::granted(now, expires_at);

        if let Some(browser) = slot.browser.as_ref() {
            match browser.cookies().await {
                Ok(jar) => slot.jar = jar,
                Err(e) => warn!(error = %e, "failed to snapshot cookie jar"),
            }
        }
        slot.last_used = Some(now);
        drop(slot);

        info!(
            elapsed_ms = now.duration_since(started).as_millis() as u64,
            valid_for_secs = expires_at.saturating_duration_since(now).as_secs(),
            "challenge cleared"
        );
        self.schedule_renewal(expires_at);
        self.schedule_idle();
        Ok(())
    }

    /// Navigate to the origin and poll until the page is cleared.
    async fn poll_challenge(&self, slot: &mut SessionSlot) -> AcquireResult<ChallengeObservation> {
        let timeout = self.config.challenge_timeout();
        let browser = slot
            .browser
            .as_mut()
            .ok_or_else(|| AcquireError::BrowserUnavailable("browser not running".into()))?;

        if let Err(e) = browser.navigate(&self.config.origin, timeout).await {
            warn!(error = %e, "navigation to origin failed, polling anyway");
        }

        let browser: &dyn BrowserSession = &**browser;
        let policy = RetryPolicy::fixed(self.config.poll_interval(), self.config.poll_attempts());
        let result = retry_with_backoff(&policy, &self.token, |attempt| async move {
            match self.observe_once(browser).await {
                Ok(ChallengeObservation::Pending) => {
                    debug!(attempt, "challenge still pending");
                    RetryAction::Retry(AcquireError::ChallengeTimeout(timeout))
                }
                Ok(obs) => RetryAction::Success(obs),
                Err(e) => RetryAction::Retry(e),
            }
        })
        .await;

        match result {
            Ok(obs) => Ok(obs),
            Err(e @ (AcquireError::Cancelled | AcquireError::BrowserUnavailable(_))) => Err(e),
            Err(_) => Err(AcquireError::ChallengeTimeout(timeout)),
        }
    }

    async fn forget_clearance_cookie(&self, slot: &mut SessionSlot) {
        let name = self.config.clearance_cookie.as_str();
        slot.jar.retain(|c| c.name != name);
        let Some(browser) = slot.browser.as_ref() else {
            return;
        };
        let stale: Vec<SessionCookie> = match browser.cookies().await {
            Ok(jar) => jar.into_iter().filter(|c| c.name == name).collect(),
            Err(e) => {
                warn!(error = %e, "failed to read cookie jar before solve");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }
        match browser.delete_cookies(&stale).await {
            Ok(()) => debug!(cookies = stale.len(), "dropped previous clearance cookie"),
            Err(e) => warn!(error = %e, "failed to drop previous clearance cookie"),
        }
    }

    async fn observe_once(&self, browser: &dyn BrowserSession) -> AcquireResult<ChallengeObservation> {
        let cookies = browser.cookies().await?;
        let title = browser.title().await?;
        let body = browser.content().await?;
        let observation = observe(
            &cookies,
            &self.config.clearance_cookie,
            &title,
            &body,
            &self.config.challenge_markers,
        );

        // A cookie due for renewal within one poll is the one being replaced;
        // keep polling for its successor.
        if let ChallengeObservation::Cleared {
            cookie_expires: Some(unix),
        } = observation
        {
            let horizon = self.config.renewal_margin() + self.config.poll_interval();
            if unix <= self.clock.unix_now() + horizon.as_secs_f64() {
                return Ok(ChallengeObservation::Pending);
            }
        }
        Ok(observation)
    }

    async fn fetch_locked(self: &Arc<Self>, identity: &Identity, url: &str) -> AcquireResult<GatewayResponse> {
        let mut slot = tokio::select! {
            _ = self.token.cancelled() => return Err(AcquireError::Cancelled),
            slot = self.session.lock() => slot,
        };

        self.ensure_browser(&mut slot).await?;
        if slot.identity.as_ref() != Some(identity) {
            self.swap_identity(&mut slot, identity).await?;
        }

        let browser = slot
            .browser
            .as_ref()
            .ok_or_else(|| AcquireError::BrowserUnavailable("browser not running".into()))?;
        let timeout = self.config.fetch_timeout();
        let response = tokio::select! {
            _ = self.token.cancelled() => Err(AcquireError::Cancelled),
            fetched = tokio::time::timeout(timeout, browser.fetch(url)) => {
                fetched.unwrap_or_else(|_| {
                    Err(AcquireError::UpstreamUnavailable(format!("fetch timed out after {timeout:?}")))
                })
            }
        };

        slot.fetches_since_launch += 1;
        slot.last_used = Some(self.clock.now());
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        let threshold = self.config.recycle_after_fetches;
        if threshold > 0 && slot.fetches_since_launch >= threshold {
            self.recycle(&mut slot).await;
        }
        drop(slot);
        self.schedule_idle();

        let response = response?;
        debug!(identity = %identity.name, url, status = response.status, "gateway fetch");
        if matches!(response.status, 401 | 403) {
            warn!(
                identity = %identity.name,
                status = response.status,
                "upstream rejected identity; clearance left untouched"
            );
        }
        Ok(response)
    }

    /// Replace the previous identity's cookies with `identity`'s, leaving
    /// clearance and other site cookies in place.
    async fn swap_identity(&self, slot: &mut SessionSlot, identity: &Identity) -> AcquireResult<()> {
        let browser = slot
            .browser
            .as_ref()
            .ok_or_else(|| AcquireError::BrowserUnavailable("browser not running".into()))?;

        let mut stale: Vec<SessionCookie> = identity.cookies.clone();
        if let Some(previous) = slot.identity.as_ref() {
            stale.extend(previous.cookies.iter().cloned());
        }
        stale.retain(|c| c.name != self.config.clearance_cookie);

        // Until the new cookies are in, the jar belongs to nobody.
        slot.identity = None;
        browser.delete_cookies(&stale).await?;
        browser.set_cookies(&identity.cookies).await?;
        slot.jar = browser.cookies().await?;
        slot.identity = Some(identity.clone());
        debug!(identity = %identity.name, "swapped cookie jar identity");
        Ok(())
    }

    /// Reuse the running browser if it passes a health probe, otherwise
    /// launch a new one and restore the jar snapshot into it.
    async fn ensure_browser(&self, slot: &mut SessionSlot) -> AcquireResult<()> {
        if let Some(browser) = slot.browser.as_ref() {
            match tokio::time::timeout(PROBE_TIMEOUT, browser.probe()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => warn!(error = %e, "browser failed health probe, relaunching"),
                Err(_) => warn!("browser health probe timed out, relaunching"),
            }
            self.teardown(slot, false).await;
        }

        let browser = self.driver.launch().await?;
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        if !slot.jar.is_empty() {
            if let Err(e) = browser.set_cookies(&slot.jar).await {
                warn!(error = %e, "failed to restore cookie jar into new browser");
            }
        }
        slot.browser = Some(browser);
        slot.fetches_since_launch = 0;
        info!(restored_cookies = slot.jar.len(), "browser launched");
        Ok(())
    }

    async fn recycle(&self, slot: &mut SessionSlot) {
        info!(fetches = slot.fetches_since_launch, "recycling browser");
        self.teardown(slot, true).await;
        self.counters.recycles.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.ensure_browser(slot).await {
            warn!(error = %e, "relaunch after recycle failed; will retry on next use");
        }
    }

    /// Close the browser, optionally snapshotting its jar first.
    async fn teardown(&self, slot: &mut SessionSlot, snapshot: bool) {
        let Some(browser) = slot.browser.take() else {
            return;
        };
        if snapshot {
            match browser.cookies().await {
                Ok(jar) => slot.jar = jar,
                Err(e) => warn!(error = %e, "failed to snapshot cookie jar before close"),
            }
        }
        if let Err(e) = browser.close().await {
            debug!(error = %e, "browser close reported an error");
        }
        slot.fetches_since_launch = 0;
    }

    async fn close_if_idle(&self) {
        let mut slot = self.session.lock().await;
        let idle_for = slot
            .last_used
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or(Duration::MAX);
        if slot.browser.is_none() || idle_for < self.config.idle_timeout() {
            return;
        }
        self.teardown(&mut slot, true).await;
        info!(idle_secs = idle_for.as_secs(), "closed idle browser");
    }

    fn schedule_renewal(self: &Arc<Self>, expires_at: Instant) {
        let margin = self.config.renewal_margin();
        let deadline = expires_at.checked_sub(margin).unwrap_or(expires_at);
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.renewal.schedule_at(deadline, self.token.clone(), async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Run on its own task: the solve reschedules this timer, which
            // aborts the task the timer itself runs on.
            tokio::spawn(async move {
                info!("renewing clearance ahead of expiry");
                if let Err(e) = inner.ensure_ready().await {
                    warn!(error = %e, "proactive clearance renewal failed");
                }
            });
        });
    }

    fn schedule_idle(self: &Arc<Self>) {
        let deadline = self.clock.now() + self.config.idle_timeout();
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.idle.schedule_at(deadline, self.token.clone(), async move {
            if let Some(inner) = weak.upgrade() {
                inner.close_if_idle().await;
            }
        });
    }
}
