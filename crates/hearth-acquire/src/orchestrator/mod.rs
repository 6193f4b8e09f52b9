//! Asset acquisition orchestrator: fetches card art from the public art host
//! into the disk cache, one asset at a time on demand or in prioritized bulk
//! sweeps.
//!
//! Every (id, variant) pair ends up either as a hit file or a miss sentinel
//! in the cache; pairs that keep failing transiently are simply left for a
//! future sweep. A sweep over a fully resolved catalog makes no requests.

pub mod catalog;
pub mod client;
pub mod gate;
pub mod progress;

use crate::cache::{DiskCache, EntryState};
use crate::config::{OrchestratorConfig, PhaseConfig};
use crate::error::{AcquireError, AcquireResult};
use crate::flight::SingleFlight;
use crate::retry::{retry_with_backoff, RetryAction};
use bytes::Bytes;
use catalog::{AssetKey, Catalog};
use client::ArtClient;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gate::RateLimitGate;
use parking_lot::Mutex;
use progress::{AssetOutcome, ProgressEventKind, ProgressReceiver, ProgressSnapshot, SweepProgress};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One pending download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTask {
    pub cache_key: String,
    pub url: String,
    pub attempts_remaining: u32,
}

impl FetchTask {
    pub fn new(cache_key: impl Into<String>, url: impl Into<String>, attempts: u32) -> Self {
        Self {
            cache_key: cache_key.into(),
            url: url.into(),
            attempts_remaining: attempts.max(1),
        }
    }

    /// Task for `key` with its URL rendered from `template`.
    pub fn for_key(key: &AssetKey, template: &str, attempts: u32) -> Self {
        Self::new(key.cache_key(), key.url(template), attempts)
    }
}

/// Outcome of one [`AssetOrchestrator::run_batch`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Downloaded and written as hits.
    pub fetched: usize,
    /// Answered 404; returned in `not_found_tasks` for the caller to record.
    pub not_found: usize,
    /// 429 responses observed.
    pub rate_limited: usize,
    pub not_found_tasks: Vec<FetchTask>,
    /// Tasks that ran out of attempts (or were cut off by shutdown).
    pub pending: Vec<FetchTask>,
}

/// Outcome of one sweep phase.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub name: String,
    /// Unresolved keys the phase started with.
    pub scheduled: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub rate_limited: usize,
    /// Keys still unresolved after the last round.
    pub unresolved: usize,
    pub rounds: u32,
    pub skipped: bool,
}

/// Outcome of [`AssetOrchestrator::run_prioritized_sweep`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub phases: Vec<PhaseReport>,
    pub fetched: usize,
    pub not_found: usize,
    pub unresolved: usize,
    pub elapsed_ms: u64,
}

/// What one shared download resolved to. A 404 is reported, not recorded:
/// `fetch_one` writes the miss itself, a batch leaves it to its caller.
#[derive(Debug, Clone)]
enum Fetched {
    Hit(Bytes),
    Missing,
}

type FetchOutcome = AcquireResult<Fetched>;

const BACKGROUND_POLL: Duration = Duration::from_millis(100);

struct Inner {
    config: OrchestratorConfig,
    cache: DiskCache,
    client: ArtClient,
    flights: SingleFlight<String, FetchOutcome>,
    background: DashMap<String, JoinHandle<()>>,
    progress: SweepProgress,
    token: CancellationToken,
}

/// Batch downloader for card art.
///
/// Cheap to clone; clones share the cache, in-flight fetches and progress.
#[derive(Clone)]
pub struct AssetOrchestrator {
    inner: Arc<Inner>,
}

impl AssetOrchestrator {
    /// Open the cache and build the HTTP client described by `config`.
    pub fn new(config: OrchestratorConfig) -> AcquireResult<Self> {
        let cache = DiskCache::open(&config.cache_dir, &config.file_extension)?;
        let client = ArtClient::new(config.request_timeout(), config.max_retry_after())?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                client,
                flights: SingleFlight::new(),
                background: DashMap::new(),
                progress: SweepProgress::new(),
                token: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &DiskCache {
        &self.inner.cache
    }

    /// Bytes for `cache_key`, fetching from `url` if the cache has nothing.
    ///
    /// A hit returns its bytes and a miss returns `None`, both without
    /// touching the network. Otherwise one request is shared by every
    /// concurrent caller for the key: success writes a hit, 404 writes a miss
    /// and returns `None`. Any other failure returns `None` for this call and
    /// leaves a bounded background retry chain working on the key.
    ///
    /// Errors only for cache I/O, an invalid key, or after shutdown.
    pub async fn fetch_one(&self, cache_key: &str, url: &str) -> AcquireResult<Option<Bytes>> {
        let inner = &self.inner;
        if inner.token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        match inner.cache.state(cache_key).await? {
            EntryState::Hit(_) => return inner.cache.read(cache_key).await,
            EntryState::Miss => return Ok(None),
            EntryState::Absent => {}
        }

        match inner.fetch_recording_miss(cache_key, url).await {
            Ok(bytes) => Ok(bytes),
            Err(e @ (AcquireError::Cancelled | AcquireError::Io(_) | AcquireError::InvalidKey(_))) => {
                Err(e)
            }
            Err(e) => {
                warn!(key = cache_key, error = %e, "art fetch failed, retrying in background");
                let first_delay = inner.config.retry.delay_after(0, &e);
                inner.spawn_background_retry(cache_key, url, first_delay);
                Ok(None)
            }
        }
    }

    /// [`fetch_one`](Self::fetch_one) for a catalog key.
    pub async fn fetch_asset(&self, key: &AssetKey) -> AcquireResult<Option<Bytes>> {
        let url = key.url(&self.inner.config.url_template);
        self.fetch_one(&key.cache_key(), &url).await
    }

    /// Download `tasks` with at most `concurrency` requests in flight, each
    /// worker sleeping `inter_request_delay` after every request.
    ///
    /// Downloads share in-flight requests with `fetch_one` and other batches.
    /// Hits are written to the cache here. 404s are only reported: the caller
    /// decides whether to record misses. A 429 pauses every worker through
    /// the shared gate and requeues the task without spending an attempt;
    /// other retryable failures cost one.
    pub async fn run_batch(
        &self,
        tasks: Vec<FetchTask>,
        concurrency: usize,
        inter_request_delay: Duration,
    ) -> BatchReport {
        let total = tasks.len();
        if total == 0 {
            return BatchReport::default();
        }

        let queue = Mutex::new(VecDeque::from(tasks));
        let report = Mutex::new(BatchReport::default());
        let gate = RateLimitGate::new();
        let workers = concurrency.clamp(1, total);

        debug!(tasks = total, workers, "batch started");
        let pool = (0..workers).map(|_| {
            self.inner
                .batch_worker(&queue, &report, &gate, inter_request_delay)
        });
        futures::future::join_all(pool).await;

        let mut report = report.into_inner();
        // Anything still queued was cut off by shutdown.
        report.pending.extend(queue.into_inner());
        debug!(
            fetched = report.fetched,
            not_found = report.not_found,
            rate_limited = report.rate_limited,
            pending = report.pending.len(),
            "batch finished"
        );
        report
    }

    /// Run every configured phase in order over `catalog`.
    ///
    /// Each phase only schedules keys that no earlier phase claimed and that
    /// are not yet resolved in the cache, then runs up to `retry_rounds`
    /// batches; rounds after the first wait out the retry policy's delay.
    /// 404s become miss sentinels. Keys still failing after the last round
    /// are dropped until the next sweep.
    pub async fn run_prioritized_sweep(&self, catalog: &Catalog) -> AcquireResult<SweepReport> {
        let inner = &self.inner;
        if inner.token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        let started = Instant::now();

        let all = catalog.keys();
        let mut resolved = 0;
        for key in &all {
            if inner.cache.state(&key.cache_key()).await?.is_resolved() {
                resolved += 1;
            }
        }
        inner.progress.reset(all.len());
        inner.progress.advance(resolved);
        info!(keys = all.len(), resolved, cards = catalog.len(), "sweep started");

        let mut report = SweepReport::default();
        let mut claimed: HashSet<AssetKey> = HashSet::new();
        for phase in &inner.config.phases {
            if inner.token.is_cancelled() {
                break;
            }
            let mut keys = Vec::new();
            for key in catalog.select(phase.selector) {
                if !claimed.insert(key.clone()) {
                    continue;
                }
                if !inner.cache.state(&key.cache_key()).await?.is_resolved() {
                    keys.push(key);
                }
            }
            let phase_report = self.run_phase(phase, keys).await?;
            report.fetched += phase_report.fetched;
            report.not_found += phase_report.not_found;
            report.unresolved += phase_report.unresolved;
            report.phases.push(phase_report);
        }

        inner.progress.set_phase(None);
        if inner.token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        inner.progress.emit(ProgressEventKind::SweepComplete {
            fetched: report.fetched,
            not_found: report.not_found,
            unresolved: report.unresolved,
            elapsed_ms: report.elapsed_ms,
        });
        info!(
            fetched = report.fetched,
            not_found = report.not_found,
            unresolved = report.unresolved,
            elapsed_ms = report.elapsed_ms,
            "sweep complete"
        );
        Ok(report)
    }

    async fn run_phase(&self, phase: &PhaseConfig, keys: Vec<AssetKey>) -> AcquireResult<PhaseReport> {
        let inner = &self.inner;
        let mut report = PhaseReport {
            name: phase.name.clone(),
            scheduled: keys.len(),
            ..PhaseReport::default()
        };
        if keys.is_empty() {
            report.skipped = true;
            debug!(phase = %phase.name, "phase skipped, nothing pending");
            inner.progress.emit(ProgressEventKind::PhaseSkipped {
                phase: phase.name.clone(),
                reason: "nothing pending".to_string(),
            });
            return Ok(report);
        }

        let started = Instant::now();
        inner.progress.set_phase(Some(phase.name.as_str()));
        inner.progress.emit(ProgressEventKind::PhaseStarted {
            phase: phase.name.clone(),
            pending: keys.len(),
        });
        info!(
            phase = %phase.name,
            pending = keys.len(),
            concurrency = phase.concurrency,
            "phase started"
        );

        let template = &inner.config.url_template;
        let mut tasks: Vec<FetchTask> = keys
            .iter()
            .map(|k| FetchTask::for_key(k, template, phase.attempts_per_round))
            .collect();

        for round in 0..phase.retry_rounds.max(1) {
            if round > 0 {
                let delay = inner.config.retry.delay_for_attempt(round - 1);
                info!(
                    phase = %phase.name,
                    round = round + 1,
                    remaining = tasks.len(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying unresolved assets"
                );
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let batch = self
                .run_batch(tasks, phase.concurrency, phase.inter_request_delay())
                .await;
            report.rounds = round + 1;
            report.fetched += batch.fetched;
            report.not_found += batch.not_found;
            report.rate_limited += batch.rate_limited;

            for task in &batch.not_found_tasks {
                inner.cache.write_miss(&task.cache_key).await?;
            }

            tasks = batch
                .pending
                .into_iter()
                .map(|mut t| {
                    t.attempts_remaining = phase.attempts_per_round.max(1);
                    t
                })
                .collect();
            if tasks.is_empty() || inner.token.is_cancelled() {
                break;
            }
        }

        report.unresolved = tasks.len();
        if report.unresolved > 0 {
            warn!(
                phase = %phase.name,
                unresolved = report.unresolved,
                "assets left for a future sweep"
            );
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        inner.progress.emit(ProgressEventKind::PhaseCompleted {
            phase: phase.name.clone(),
            fetched: report.fetched,
            not_found: report.not_found,
            unresolved: report.unresolved,
            duration_ms,
        });
        info!(
            phase = %phase.name,
            fetched = report.fetched,
            not_found = report.not_found,
            unresolved = report.unresolved,
            duration_ms,
            "phase completed"
        );
        Ok(report)
    }

    /// Clear the miss sentinel of every key whose catalog entry changed or
    /// newly appeared between `old` and `new`. Returns the keys cleared.
    pub async fn invalidate_changed(&self, old: &Catalog, new: &Catalog) -> AcquireResult<Vec<AssetKey>> {
        let mut cleared = Vec::new();
        for key in new.changed_since(old) {
            if self.inner.cache.clear_miss(&key.cache_key()).await? {
                cleared.push(key);
            }
        }
        info!(cleared = cleared.len(), "miss markers invalidated");
        Ok(cleared)
    }

    /// Done/total counters of the current (or last) sweep.
    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> ProgressReceiver {
        self.inner.progress.subscribe()
    }

    /// Number of keys with a background retry chain running.
    pub fn background_retries(&self) -> usize {
        self.inner
            .background
            .iter()
            .filter(|e| !e.value().is_finished())
            .count()
    }

    /// Wait until every background retry chain has finished, or shutdown.
    pub async fn wait_for_background(&self) {
        let mut ticks = tokio::time::interval(BACKGROUND_POLL);
        while self.background_retries() > 0 {
            tokio::select! {
                _ = self.inner.token.cancelled() => return,
                _ = ticks.tick() => {}
            }
        }
    }

    /// Stop background retries and wake every sleeping worker. Later calls
    /// fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
        self.inner.background.retain(|_, handle| {
            handle.abort();
            false
        });
        info!("asset orchestrator shut down");
    }
}

impl Inner {
    /// One request for `key`, shared by every concurrent caller.
    async fn fetch_shared(self: &Arc<Self>, key: &str, url: &str) -> FetchOutcome {
        let inner = Arc::clone(self);
        let (owned_key, owned_url) = (key.to_string(), url.to_string());
        let (outcome, leader) = self
            .flights
            .run(key.to_string(), move || async move {
                inner.fetch_and_store(&owned_key, &owned_url).await
            })
            .await;
        if !leader {
            debug!(key, "joined in-flight art fetch");
        }
        outcome
    }

    /// [`fetch_shared`](Self::fetch_shared), recording a 404 as a miss.
    async fn fetch_recording_miss(
        self: &Arc<Self>,
        key: &str,
        url: &str,
    ) -> AcquireResult<Option<Bytes>> {
        match self.fetch_shared(key, url).await? {
            Fetched::Hit(bytes) => Ok(Some(bytes)),
            Fetched::Missing => {
                if self.cache.write_miss(key).await? {
                    debug!(key, "art missing upstream, miss recorded");
                }
                Ok(None)
            }
        }
    }

    async fn fetch_and_store(&self, key: &str, url: &str) -> FetchOutcome {
        // A caller that finished just before us may already have resolved it.
        match self.cache.state(key).await? {
            EntryState::Hit(_) => {
                if let Some(bytes) = self.cache.read(key).await? {
                    return Ok(Fetched::Hit(bytes));
                }
            }
            EntryState::Miss => return Ok(Fetched::Missing),
            EntryState::Absent => {}
        }

        match self.download(url).await {
            Ok(bytes) => {
                self.cache.write_hit(key, &bytes).await?;
                debug!(key, bytes = bytes.len(), "art cached");
                Ok(Fetched::Hit(bytes))
            }
            Err(AcquireError::NotFound) => Ok(Fetched::Missing),
            Err(e) => Err(e),
        }
    }

    async fn download(&self, url: &str) -> AcquireResult<Bytes> {
        tokio::select! {
            _ = self.token.cancelled() => Err(AcquireError::Cancelled),
            response = self.client.get(url) => response?.into_result(),
        }
    }

    fn spawn_background_retry(self: &Arc<Self>, key: &str, url: &str, first_delay: Duration) {
        if self.token.is_cancelled() {
            return;
        }
        let entry = self.background.entry(key.to_string());
        if let Entry::Occupied(existing) = &entry {
            if !existing.get().is_finished() {
                return;
            }
        }

        let inner = Arc::clone(self);
        let (key, url) = (key.to_string(), url.to_string());
        let handle = tokio::spawn(async move {
            inner.background_retry_chain(&key, &url, first_delay).await;
            inner.background.remove(&key);
        });
        entry.insert(handle);
    }

    async fn background_retry_chain(self: &Arc<Self>, key: &str, url: &str, first_delay: Duration) {
        let policy = &self.config.retry;
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = tokio::time::sleep(first_delay) => {}
        }

        let result = retry_with_backoff(policy, &self.token, |attempt| {
            let inner = Arc::clone(self);
            async move {
                debug!(key, attempt = attempt + 1, "background art retry");
                match inner.fetch_recording_miss(key, url).await {
                    Ok(bytes) => RetryAction::Success(bytes.is_some()),
                    Err(e) if e.is_retryable() => RetryAction::Retry(e),
                    Err(e) => RetryAction::Fail(e),
                }
            }
        })
        .await;

        match result {
            Ok(true) => info!(key, "background retry cached art"),
            Ok(false) => debug!(key, "background retry resolved as missing"),
            Err(AcquireError::Cancelled) => {}
            Err(e) => warn!(key, error = %e, "background retries exhausted, leaving for a future sweep"),
        }
    }

    async fn batch_worker(
        self: &Arc<Self>,
        queue: &Mutex<VecDeque<FetchTask>>,
        report: &Mutex<BatchReport>,
        gate: &RateLimitGate,
        inter_request_delay: Duration,
    ) {
        loop {
            if !gate.wait(&self.token).await {
                return;
            }
            let Some(mut task) = queue.lock().pop_front() else {
                return;
            };

            let outcome = self.fetch_shared(&task.cache_key, &task.url).await;
            match outcome {
                Ok(Fetched::Hit(_)) => {
                    report.lock().fetched += 1;
                    self.progress.advance(1);
                    self.emit_processed(&task, AssetOutcome::Fetched);
                }
                Ok(Fetched::Missing) => {
                    debug!(key = %task.cache_key, "art missing upstream");
                    {
                        let mut report = report.lock();
                        report.not_found += 1;
                        report.not_found_tasks.push(task.clone());
                    }
                    self.progress.advance(1);
                    self.emit_processed(&task, AssetOutcome::NotFound);
                }
                Err(AcquireError::Cancelled) => {
                    report.lock().pending.push(task);
                    return;
                }
                Err(AcquireError::RateLimited { retry_after }) => {
                    let pause = retry_after
                        .unwrap_or_else(|| self.config.default_retry_after())
                        .min(self.config.max_retry_after());
                    gate.pause(pause);
                    report.lock().rate_limited += 1;
                    warn!(key = %task.cache_key, pause_ms = pause.as_millis() as u64, "rate limited, pausing workers");
                    self.progress.emit(ProgressEventKind::RateLimited {
                        retry_after_ms: pause.as_millis() as u64,
                    });
                    queue.lock().push_back(task);
                }
                Err(AcquireError::Io(e)) => {
                    warn!(key = %task.cache_key, error = %e, "failed to write art to cache");
                    self.progress.emit(ProgressEventKind::Warning {
                        message: format!("cache write failed for {}: {e}", task.cache_key),
                    });
                    self.emit_processed(&task, AssetOutcome::Failed);
                    report.lock().pending.push(task);
                }
                Err(e) => {
                    debug!(key = %task.cache_key, error = %e, "art fetch failed");
                    task.attempts_remaining = task.attempts_remaining.saturating_sub(1);
                    if e.is_retryable() && task.attempts_remaining > 0 {
                        queue.lock().push_back(task);
                    } else {
                        self.emit_processed(&task, AssetOutcome::Failed);
                        report.lock().pending.push(task);
                    }
                }
            }

            if !inter_request_delay.is_zero() {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(inter_request_delay) => {}
                }
            }
        }
    }

    fn emit_processed(&self, task: &FetchTask, outcome: AssetOutcome) {
        self.progress.emit(ProgressEventKind::AssetProcessed {
            key: task.cache_key.clone(),
            outcome,
        });
    }
}
