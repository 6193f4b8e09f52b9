//! Owned, cancellable one-shot timers.
//!
//! A [`ScheduledTask`] holds at most one pending job. Scheduling a new job
//! supersedes the previous one, and dropping the slot aborts whatever is
//! pending, so timers never outlive the service that owns them.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A single-slot timer.
pub struct ScheduledTask {
    name: &'static str,
    slot: Mutex<Option<Pending>>,
}

struct Pending {
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Run `job` at `deadline`, replacing any pending job.
    ///
    /// The job is skipped if `token` is cancelled before the deadline.
    pub fn schedule_at<F>(&self, deadline: Instant, token: CancellationToken, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(timer = name, "timer fired");
                    job.await;
                }
            }
        });

        if let Some(previous) = self.slot.lock().replace(Pending { deadline, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort the pending job, if any.
    pub fn cancel(&self) {
        if let Some(previous) = self.slot.lock().take() {
            previous.handle.abort();
        }
    }

    /// Deadline of the pending job, if one is scheduled and has not finished.
    pub fn deadline(&self) -> Option<Instant> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|p| !p.handle.is_finished())
            .map(|p| p.deadline)
    }

    pub fn is_pending(&self) -> bool {
        self.deadline().is_some()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
