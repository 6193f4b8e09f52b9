//! Configuration loading and resolution.
//!
//! Every knob has a default. A JSON file (see [`resolve_config_path`]) may
//! override any subset, and `HEARTH_*` environment variables are applied on
//! top of the file.

use crate::error::{AcquireError, AcquireResult};
use crate::orchestrator::catalog::PhaseSelector;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for both components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    pub gateway: GatewayConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Session gateway tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Origin the challenge is solved against.
    pub origin: String,
    /// Name of the cookie proving clearance.
    pub clearance_cookie: String,
    /// Case-insensitive strings whose presence in the page title or body
    /// marks a challenge page.
    pub challenge_markers: Vec<String>,
    pub challenge_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Clearance lifetime assumed when the cookie carries no expiry.
    pub default_clearance_secs: u64,
    /// Clearance is renewed this long before it expires.
    pub renewal_margin_secs: u64,
    /// Close the browser after this much inactivity.
    pub idle_timeout_secs: u64,
    /// Relaunch the browser after this many fetches. 0 disables recycling.
    pub recycle_after_fetches: u64,
    pub fetch_timeout_secs: u64,
    pub chromium_path: Option<PathBuf>,
    pub headless: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            origin: "https://hsreplay.net".to_string(),
            clearance_cookie: "cf_clearance".to_string(),
            challenge_markers: vec![
                "just a moment".to_string(),
                "attention required".to_string(),
                "checking your browser".to_string(),
                "challenge-platform".to_string(),
                "cf-challenge".to_string(),
            ],
            challenge_timeout_secs: 60,
            poll_interval_ms: 1000,
            default_clearance_secs: 30 * 60,
            renewal_margin_secs: 120,
            idle_timeout_secs: 5 * 60,
            recycle_after_fetches: 200,
            fetch_timeout_secs: 30,
            chromium_path: None,
            headless: true,
        }
    }
}

impl GatewayConfig {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn default_clearance(&self) -> Duration {
        Duration::from_secs(self.default_clearance_secs)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Poll attempts that fit in the challenge timeout.
    pub fn poll_attempts(&self) -> u32 {
        let attempts = self.challenge_timeout().as_millis() / self.poll_interval().as_millis().max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// One phase of a prioritized sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub selector: PhaseSelector,
    pub concurrency: usize,
    #[serde(default)]
    pub inter_request_delay_ms: u64,
    /// Batch rounds; rounds after the first wait out the retry policy's delay.
    #[serde(default = "default_retry_rounds")]
    pub retry_rounds: u32,
    /// Attempts a task gets inside a single round.
    #[serde(default = "default_attempts_per_round")]
    pub attempts_per_round: u32,
}

fn default_retry_rounds() -> u32 {
    3
}

fn default_attempts_per_round() -> u32 {
    2
}

impl PhaseConfig {
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

/// Asset orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub cache_dir: PathBuf,
    /// Extension of hit files.
    pub file_extension: String,
    /// Art host URL with `{id}` and `{variant}` placeholders.
    pub url_template: String,
    pub request_timeout_ms: u64,
    /// Pause applied on a 429 without a usable `Retry-After`.
    pub default_retry_after_secs: u64,
    /// Upper bound on any pause requested by the host.
    pub max_retry_after_secs: u64,
    /// Policy for `fetch_one` background retries and sweep rounds.
    pub retry: RetryPolicy,
    pub phases: Vec<PhaseConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_dir: crate::cache::DiskCache::default_dir(),
            file_extension: "png".to_string(),
            url_template: "https://art.hearthstonejson.com/v1/render/latest/enUS/256x/{id}_{variant}.png"
                .to_string(),
            request_timeout_ms: 15_000,
            default_retry_after_secs: 5,
            max_retry_after_secs: 120,
            retry: RetryPolicy::default(),
            phases: default_phases(),
        }
    }
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }
}

/// Owned premium art first, then owned normal art, then everything else
/// at a gentler pace.
pub fn default_phases() -> Vec<PhaseConfig> {
    vec![
        PhaseConfig {
            name: "owned-premium".to_string(),
            selector: PhaseSelector::OwnedPremium,
            concurrency: 6,
            inter_request_delay_ms: 50,
            retry_rounds: 3,
            attempts_per_round: 2,
        },
        PhaseConfig {
            name: "owned-normal".to_string(),
            selector: PhaseSelector::OwnedNormal,
            concurrency: 6,
            inter_request_delay_ms: 50,
            retry_rounds: 3,
            attempts_per_round: 2,
        },
        PhaseConfig {
            name: "remaining".to_string(),
            selector: PhaseSelector::All,
            concurrency: 3,
            inter_request_delay_ms: 200,
            retry_rounds: 2,
            attempts_per_round: 2,
        },
    ]
}

impl AcquireConfig {
    /// Load from `path`, falling back to defaults if the file does not exist,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> AcquireResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| {
                AcquireError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `HEARTH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_string = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let read_u64 = |name: &str| read_string(name).and_then(|v| v.parse::<u64>().ok());

        let g = &mut self.gateway;
        if let Some(v) = read_string("HEARTH_ORIGIN") {
            g.origin = v;
        }
        if let Some(v) = read_u64("HEARTH_CHALLENGE_TIMEOUT_SECS") {
            g.challenge_timeout_secs = v;
        }
        if let Some(v) = read_u64("HEARTH_IDLE_TIMEOUT_SECS") {
            g.idle_timeout_secs = v;
        }
        if let Some(v) = read_u64("HEARTH_RENEWAL_MARGIN_SECS") {
            g.renewal_margin_secs = v;
        }
        if let Some(v) = read_u64("HEARTH_RECYCLE_AFTER_FETCHES") {
            g.recycle_after_fetches = v;
        }
        if let Some(v) = read_string("HEARTH_CHROMIUM_PATH") {
            g.chromium_path = Some(PathBuf::from(v));
        }

        let o = &mut self.orchestrator;
        if let Some(v) = read_string("HEARTH_CACHE_DIR") {
            o.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = read_string("HEARTH_ART_URL_TEMPLATE") {
            o.url_template = v;
        }
        if let Some(v) = read_u64("HEARTH_RETRY_MAX_ATTEMPTS") {
            o.retry.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = read_string("HEARTH_RETRY_MULTIPLIER").and_then(|v| v.parse::<f64>().ok())
        {
            o.retry.multiplier = v;
        }
    }

    /// Reject values that would make the components misbehave.
    pub fn validate(&self) -> AcquireResult<()> {
        if self.gateway.challenge_timeout_secs == 0 {
            return Err(AcquireError::Config(
                "gateway.challenge_timeout_secs must be positive".into(),
            ));
        }
        if self.gateway.default_clearance_secs <= self.gateway.renewal_margin_secs {
            return Err(AcquireError::Config(
                "gateway.default_clearance_secs must exceed gateway.renewal_margin_secs".into(),
            ));
        }
        if self.gateway.poll_interval_ms == 0 {
            return Err(AcquireError::Config(
                "gateway.poll_interval_ms must be positive".into(),
            ));
        }
        if !self.orchestrator.url_template.contains("{id}") {
            return Err(AcquireError::Config(
                "orchestrator.url_template must contain {id}".into(),
            ));
        }
        if let Some(phase) = self.orchestrator.phases.iter().find(|p| p.concurrency == 0) {
            return Err(AcquireError::Config(format!(
                "phase {} has zero concurrency",
                phase.name
            )));
        }
        let multiplier = self.orchestrator.retry.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(AcquireError::Config(
                "orchestrator.retry.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the config file path.
///
/// Order: explicit path, `HEARTH_ACQUIRE_CONFIG`, `./.hearth-acquire/config.json`,
/// then `~/.hearth-acquire/config.json`.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var("HEARTH_ACQUIRE_CONFIG") {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    let cwd_config = PathBuf::from(".hearth-acquire/config.json");
    if cwd_config.exists() {
        return cwd_config;
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hearth-acquire")
        .join("config.json")
}
