//! Session gateway behaviour against a scripted browser.
//!
//! All tests run on a paused tokio clock, so challenge polling, idle windows
//! and renewal timers elapse instantly.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hearth_acquire::{
    AcquireError, AcquireResult, BrowserDriver, BrowserSession, Clock, GatewayConfig,
    GatewayResponse, Identity, SessionCookie, SessionGateway, TokioClock,
};

// ─────────────────────── scripted browser ───────────────────────

#[derive(Clone, Copy)]
enum Challenge {
    /// The challenge shows while the jar has no clearance cookie; one is
    /// issued after this many polls following a navigation.
    ClearsAfter(usize),
    /// A plain page: no challenge at all.
    Absent,
    /// The challenge page never goes away.
    Never,
}

struct Script {
    challenge: Challenge,
    clearance_ttl: Duration,
    fetch_delay: Duration,
    fetch_status: AtomicU16,
    probe_fails_once: AtomicBool,
    set_cookies_fails_once: AtomicBool,
    clock: Arc<TokioClock>,

    issued: AtomicUsize,

    launches: AtomicUsize,
    closes: AtomicUsize,
    in_fetch: AtomicUsize,
    max_in_fetch: AtomicUsize,
}

impl Script {
    fn new(challenge: Challenge, clock: Arc<TokioClock>) -> Arc<Self> {
        Arc::new(Self {
            challenge,
            clearance_ttl: Duration::from_secs(1800),
            fetch_delay: Duration::ZERO,
            fetch_status: AtomicU16::new(200),
            probe_fails_once: AtomicBool::new(false),
            set_cookies_fails_once: AtomicBool::new(false),
            clock,
            issued: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_fetch: AtomicUsize::new(0),
            max_in_fetch: AtomicUsize::new(0),
        })
    }
}

struct ScriptedDriver(Arc<Script>);

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn launch(&self) -> AcquireResult<Box<dyn BrowserSession>> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBrowser {
            script: Arc::clone(&self.0),
            jar: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }))
    }
}

struct ScriptedBrowser {
    script: Arc<Script>,
    jar: Mutex<Vec<SessionCookie>>,
    polls: AtomicUsize,
}

impl ScriptedBrowser {
    fn upsert(&self, cookie: SessionCookie) {
        let mut jar = self.jar.lock();
        jar.retain(|c| !(c.name == cookie.name && c.domain == cookie.domain));
        jar.push(cookie);
    }

    fn has_clearance(&self) -> bool {
        self.jar.lock().iter().any(|c| c.name == "cf_clearance")
    }
}

#[async_trait]
impl BrowserSession for ScriptedBrowser {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> AcquireResult<()> {
        self.polls.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn title(&self) -> AcquireResult<String> {
        let cleared = match self.script.challenge {
            Challenge::Absent => true,
            Challenge::ClearsAfter(_) => self.has_clearance(),
            Challenge::Never => false,
        };
        Ok(if cleared { "HSReplay.net" } else { "Just a moment..." }.to_string())
    }

    async fn content(&self) -> AcquireResult<String> {
        Ok("<html><body>page</body></html>".to_string())
    }

    async fn cookies(&self) -> AcquireResult<Vec<SessionCookie>> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Challenge::ClearsAfter(n) = self.script.challenge {
            // Like the real site, a valid cookie is accepted as is.
            if polls > n && !self.has_clearance() {
                self.script.issued.fetch_add(1, Ordering::SeqCst);
                let mut cookie = SessionCookie::new("cf_clearance", "cleared", ".hsreplay.net");
                cookie.expires =
                    Some(self.script.clock.unix_now() + self.script.clearance_ttl.as_secs_f64());
                self.upsert(cookie);
            }
        }
        Ok(self.jar.lock().clone())
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()> {
        if self.script.set_cookies_fails_once.swap(false, Ordering::SeqCst) {
            return Err(AcquireError::BrowserUnavailable("cookie write failed".into()));
        }
        for cookie in cookies {
            self.upsert(cookie.clone());
        }
        Ok(())
    }

    async fn delete_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()> {
        self.jar
            .lock()
            .retain(|c| !cookies.iter().any(|d| d.name == c.name && d.domain == c.domain));
        Ok(())
    }

    async fn fetch(&self, _url: &str) -> AcquireResult<GatewayResponse> {
        let now = self.script.in_fetch.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_in_fetch.fetch_max(now, Ordering::SeqCst);
        if !self.script.fetch_delay.is_zero() {
            tokio::time::sleep(self.script.fetch_delay).await;
        }
        // Echo the session cookie so tests can see whose jar served the call.
        let body = self
            .jar
            .lock()
            .iter()
            .find(|c| c.name == "sessionid")
            .map(|c| c.value.clone())
            .unwrap_or_default();
        self.script.in_fetch.fetch_sub(1, Ordering::SeqCst);
        Ok(GatewayResponse {
            status: self.script.fetch_status.load(Ordering::SeqCst),
            body,
        })
    }

    async fn probe(&self) -> AcquireResult<()> {
        if self.script.probe_fails_once.swap(false, Ordering::SeqCst) {
            return Err(AcquireError::BrowserUnavailable("target crashed".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> AcquireResult<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─────────────────────── helpers ───────────────────────

fn config() -> GatewayConfig {
    GatewayConfig {
        challenge_timeout_secs: 10,
        poll_interval_ms: 1000,
        ..GatewayConfig::default()
    }
}

fn gateway_with(config: GatewayConfig, script: &Arc<Script>) -> SessionGateway {
    let clock: Arc<dyn Clock> = script.clock.clone();
    SessionGateway::with_clock(config, Arc::new(ScriptedDriver(Arc::clone(script))), clock)
}

fn identity(name: &str) -> Identity {
    Identity::new(
        name,
        vec![SessionCookie::new(
            "sessionid",
            format!("{name}-session"),
            ".hsreplay.net",
        )],
    )
}

fn clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::new())
}

// ─────────────────────── clearance ───────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_ensure_ready_shares_one_solve() {
    let script = Script::new(Challenge::ClearsAfter(2), clock());
    let gateway = gateway_with(config(), &script);

    let (a, b) = tokio::join!(gateway.ensure_ready(), gateway.ensure_ready());
    assert!(a.is_ok());
    assert!(b.is_ok());

    assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.stats().solves, 1);
    assert!(gateway.status().valid);

    // Fresh clearance: no further solve.
    gateway.ensure_ready().await.unwrap();
    assert_eq!(gateway.stats().solves, 1);
}

#[tokio::test(start_paused = true)]
async fn page_without_challenge_is_ready_with_default_window() {
    let script = Script::new(Challenge::Absent, clock());
    let gateway = gateway_with(config(), &script);

    gateway.ensure_ready().await.unwrap();
    let status = gateway.status();
    assert!(status.valid);
    assert!((1790..=1800).contains(&status.expires_in_seconds));
}

#[tokio::test(start_paused = true)]
async fn unsolved_challenge_times_out() {
    let script = Script::new(Challenge::Never, clock());
    let gateway = gateway_with(
        GatewayConfig {
            challenge_timeout_secs: 5,
            ..config()
        },
        &script,
    );

    let err = gateway.ensure_ready().await.unwrap_err();
    assert!(matches!(err, AcquireError::ChallengeTimeout(_)), "got {err:?}");
    assert!(!gateway.status().valid);

    let err = gateway.fetch_as(&identity("alice"), "https://hsreplay.net/api/x").await;
    assert!(matches!(err, Err(AcquireError::ChallengeTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_a_new_solve_on_the_same_browser() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(config(), &script);

    gateway.ensure_ready().await.unwrap();
    gateway.invalidate();
    assert!(!gateway.status().valid);
    assert!(gateway.renewal_deadline().is_none());

    gateway.ensure_ready().await.unwrap();
    assert_eq!(gateway.stats().solves, 2);
    assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    assert!(gateway.status().valid);
}

#[tokio::test(start_paused = true)]
async fn renewal_refreshes_clearance_before_expiry() {
    let clock = clock();
    let mut script = Script::new(Challenge::ClearsAfter(1), Arc::clone(&clock));
    Arc::get_mut(&mut script).unwrap().clearance_ttl = Duration::from_secs(600);
    let gateway = gateway_with(config(), &script);

    gateway.ensure_ready().await.unwrap();
    assert_eq!(gateway.stats().solves, 1);
    let deadline = gateway.renewal_deadline().expect("renewal scheduled");
    let lead = deadline.duration_since(clock.now()).as_secs();
    assert!((470..=480).contains(&lead), "renewal in {lead}s");

    tokio::time::sleep(Duration::from_secs(500)).await;

    // The old cookie was still valid; renewal had to earn a new one.
    assert_eq!(gateway.stats().solves, 2);
    assert_eq!(script.issued.load(Ordering::SeqCst), 2);
    let status = gateway.status();
    assert!(status.valid);
    assert!(status.expires_in_seconds > 500);

    let response = gateway
        .fetch_as(&identity("alice"), "https://hsreplay.net/api/v1/account/")
        .await
        .unwrap();
    assert_eq!(response.body, "alice-session");
    assert_eq!(gateway.stats().solves, 2);
}

// ─────────────────────── identity-scoped fetch ───────────────────────

#[tokio::test(start_paused = true)]
async fn fetches_for_different_identities_never_interleave() {
    let mut script = Script::new(Challenge::ClearsAfter(1), clock());
    Arc::get_mut(&mut script).unwrap().fetch_delay = Duration::from_millis(50);
    let gateway = gateway_with(config(), &script);

    let alice = identity("alice");
    let bob = identity("bob");
    let calls = (0..10).map(|i| {
        let gateway = gateway.clone();
        let who = if i % 2 == 0 { alice.clone() } else { bob.clone() };
        async move {
            let response = gateway
                .fetch_as(&who, "https://hsreplay.net/api/v1/account/")
                .await
                .unwrap();
            (who.name, response.body)
        }
    });

    for (name, body) in futures::future::join_all(calls).await {
        assert_eq!(body, format!("{name}-session"));
    }
    assert_eq!(script.max_in_fetch.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.stats().solves, 1);
    assert_eq!(gateway.stats().fetches, 10);
}

#[tokio::test(start_paused = true)]
async fn rejected_identity_does_not_trigger_a_solve() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    script.fetch_status.store(401, Ordering::SeqCst);
    let gateway = gateway_with(config(), &script);

    let response = gateway
        .fetch_as(&identity("mallory"), "https://hsreplay.net/api/v1/account/")
        .await
        .unwrap();
    assert_eq!(response.status, 401);
    assert!(matches!(
        response.error_for_status(),
        Err(AcquireError::UpstreamRejected { status: 401 })
    ));

    gateway
        .fetch_as(&identity("mallory"), "https://hsreplay.net/api/v1/account/")
        .await
        .unwrap();
    assert_eq!(gateway.stats().solves, 1);
    assert!(gateway.status().valid);
}

#[tokio::test(start_paused = true)]
async fn failed_identity_swap_leaves_no_owner_behind() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(config(), &script);
    let (alice, bob) = (identity("alice"), identity("bob"));
    let url = "https://hsreplay.net/api/v1/account/";

    assert_eq!(gateway.fetch_as(&alice, url).await.unwrap().body, "alice-session");

    script.set_cookies_fails_once.store(true, Ordering::SeqCst);
    assert!(matches!(
        gateway.fetch_as(&bob, url).await,
        Err(AcquireError::BrowserUnavailable(_))
    ));

    // Alice's cookies were already removed; they must be put back.
    assert_eq!(gateway.fetch_as(&alice, url).await.unwrap().body, "alice-session");
    assert_eq!(gateway.fetch_as(&bob, url).await.unwrap().body, "bob-session");
    assert_eq!(gateway.stats().solves, 1);
}

// ─────────────────────── browser lifecycle ───────────────────────

#[tokio::test(start_paused = true)]
async fn recycling_keeps_identity_and_clearance() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(
        GatewayConfig {
            recycle_after_fetches: 3,
            ..config()
        },
        &script,
    );

    let alice = identity("alice");
    for _ in 0..7 {
        let response = gateway
            .fetch_as(&alice, "https://hsreplay.net/api/v1/collection/")
            .await
            .unwrap();
        assert_eq!(response.body, "alice-session");
    }

    let stats = gateway.stats();
    assert_eq!(stats.recycles, 2);
    assert_eq!(stats.launches, 3);
    assert_eq!(stats.solves, 1);
    assert_eq!(script.closes.load(Ordering::SeqCst), 2);
    assert!(gateway.status().valid);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_browser_is_relaunched_with_its_jar() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(config(), &script);
    let alice = identity("alice");

    gateway.fetch_as(&alice, "https://hsreplay.net/api/a").await.unwrap();
    script.probe_fails_once.store(true, Ordering::SeqCst);

    let response = gateway.fetch_as(&alice, "https://hsreplay.net/api/b").await.unwrap();
    assert_eq!(response.body, "alice-session");
    assert_eq!(script.launches.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.stats().solves, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_browser_closes_and_restores_on_next_use() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(config(), &script);
    let alice = identity("alice");

    gateway.fetch_as(&alice, "https://hsreplay.net/api/a").await.unwrap();
    assert!(gateway.has_browser().await);

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(!gateway.has_browser().await);
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);

    let response = gateway.fetch_as(&alice, "https://hsreplay.net/api/b").await.unwrap();
    assert_eq!(response.body, "alice-session");
    assert_eq!(script.launches.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.stats().solves, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_browser_and_rejects_calls() {
    let script = Script::new(Challenge::ClearsAfter(1), clock());
    let gateway = gateway_with(config(), &script);

    gateway.ensure_ready().await.unwrap();
    gateway.shutdown().await;

    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
    assert!(!gateway.status().valid);
    assert!(matches!(
        gateway.ensure_ready().await,
        Err(AcquireError::Cancelled)
    ));
    assert!(matches!(
        gateway.fetch_as(&identity("alice"), "https://hsreplay.net/api/a").await,
        Err(AcquireError::Cancelled)
    ));
}

#[tokio::test]
async fn missing_browser_surfaces_as_unavailable() {
    let gateway = SessionGateway::new(config(), Arc::new(hearth_acquire::NoopDriver));
    assert!(matches!(
        gateway.ensure_ready().await,
        Err(AcquireError::BrowserUnavailable(_))
    ));
}
