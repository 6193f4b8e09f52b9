//! Sweep progress: live counters plus a broadcast channel of events.
//!
//! Counters are always maintained so `progress()` can be polled at any time.
//! Events flow through a `tokio::sync::broadcast` channel to any number of
//! subscribers (CLI, UI); when nobody is listening they are dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// An event emitted during a sweep or batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// The kind of progress event.
    pub event: ProgressEventKind,
}

/// The specific kind of progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    /// A phase started with this many unresolved keys.
    PhaseStarted { phase: String, pending: usize },
    /// A phase finished all its rounds.
    PhaseCompleted {
        phase: String,
        fetched: usize,
        not_found: usize,
        unresolved: usize,
        duration_ms: u64,
    },
    /// A phase had nothing to do.
    PhaseSkipped { phase: String, reason: String },
    /// One asset reached a terminal state in this batch.
    AssetProcessed { key: String, outcome: AssetOutcome },
    /// The host asked the pool to pause.
    RateLimited { retry_after_ms: u64 },
    /// Every phase finished.
    SweepComplete {
        fetched: usize,
        not_found: usize,
        unresolved: usize,
        elapsed_ms: u64,
    },
    /// A non-fatal warning occurred.
    Warning { message: String },
}

/// Terminal outcome of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOutcome {
    Fetched,
    NotFound,
    Failed,
}

/// Sender handle for emitting progress events.
pub type ProgressSender = tokio::sync::broadcast::Sender<ProgressEvent>;

/// Receiver handle for consuming progress events.
pub type ProgressReceiver = tokio::sync::broadcast::Receiver<ProgressEvent>;

/// Create a new progress broadcast channel with a bounded buffer.
///
/// Slow subscribers lag and skip events rather than stall the sweep.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(1024)
}

/// Point-in-time view of sweep progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub done: usize,
    pub total: usize,
    pub phase: Option<String>,
}

/// Live counters plus the event sender.
pub struct SweepProgress {
    done: AtomicUsize,
    total: AtomicUsize,
    phase: Mutex<Option<String>>,
    seq: AtomicU64,
    tx: ProgressSender,
}

impl SweepProgress {
    pub fn new() -> Self {
        let (tx, _) = channel();
        Self {
            done: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            phase: Mutex::new(None),
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            done: self.done.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            phase: self.phase.lock().clone(),
        }
    }

    /// Start counting a new sweep of `total` keys.
    pub fn reset(&self, total: usize) {
        self.done.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        *self.phase.lock() = None;
    }

    pub fn set_phase(&self, phase: Option<&str>) {
        *self.phase.lock() = phase.map(str::to_string);
    }

    /// Count keys that reached a terminal state.
    pub fn advance(&self, n: usize) {
        if n > 0 {
            self.done.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Emit an event, silently ignoring send errors (which occur when no
    /// receivers are listening).
    pub fn emit(&self, event: ProgressEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(ProgressEvent { seq, event });
    }
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent {
            seq: 1,
            event: ProgressEventKind::PhaseStarted {
                phase: "owned-premium".to_string(),
                pending: 12,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("PhaseStarted"));
        assert!(json.contains("owned-premium"));

        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.event, event.event);
    }

    #[test]
    fn test_emit_without_receivers() {
        let progress = SweepProgress::new();
        progress.emit(ProgressEventKind::Warning {
            message: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_sees_sequenced_events() {
        let progress = SweepProgress::new();
        let mut rx = progress.subscribe();
        progress.emit(ProgressEventKind::PhaseSkipped {
            phase: "remaining".into(),
            reason: "nothing pending".into(),
        });
        progress.emit(ProgressEventKind::RateLimited {
            retry_after_ms: 1000,
        });

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(
            second.event,
            ProgressEventKind::RateLimited {
                retry_after_ms: 1000
            }
        );
    }

    #[test]
    fn test_counters() {
        let progress = SweepProgress::new();
        progress.reset(10);
        progress.set_phase(Some("owned-normal"));
        progress.advance(3);
        progress.advance(0);
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                done: 3,
                total: 10,
                phase: Some("owned-normal".into())
            }
        );
    }
}
