//! hearth-acquire: resilient acquisition of external data through a browser-backed
//! session gateway for a challenge-protected service and a rate-limit aware
//! art downloader with a persistent hit/miss disk cache.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod flight;
pub mod gateway;
pub mod orchestrator;
pub mod retry;
pub mod schedule;

pub use cache::{CacheStats, DiskCache, EntryState};
pub use clock::{Clock, TokioClock};
pub use config::{resolve_config_path, AcquireConfig, GatewayConfig, OrchestratorConfig, PhaseConfig};
pub use error::{classify_status, AcquireError, AcquireResult};
pub use gateway::browser::{
    BrowserDriver, BrowserSession, GatewayResponse, Identity, NoopDriver, SessionCookie,
};
pub use gateway::clearance::ClearanceStatus;
pub use gateway::{GatewayStats, SessionGateway};
pub use orchestrator::catalog::{AssetKey, Catalog, CatalogCard, PhaseSelector, Variant};
pub use orchestrator::progress::{ProgressEvent, ProgressEventKind, ProgressSnapshot};
pub use orchestrator::{AssetOrchestrator, BatchReport, FetchTask, PhaseReport, SweepReport};
pub use retry::{retry_with_backoff, RetryAction, RetryPolicy};
