//! Keyed scheduling of the lifecycle's deferred work.

use crate::retry::RetryPolicy;
use boxoffice_core::EngineError;
use boxoffice_core::environment::Clock;
use boxoffice_core::jobs::{JobKey, JobKind, JobPayload, JobQueue, JobRequest, QueueError};
use boxoffice_core::store::UnitOfWork;
use boxoffice_core::types::TransactionId;
use chrono::TimeDelta;
use std::sync::Arc;
use std::time::Duration;

/// Schedules and cancels `(kind, uuid)` jobs on a durable queue.
///
/// Jobs are enqueued inside the unit of work that creates their reason to
/// exist, with the scheduler's [`RetryPolicy`]. Cancellation is advisory: a
/// handler already running must still re-check the status.
#[derive(Clone)]
pub struct DelayedJobScheduler {
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl DelayedJobScheduler {
    /// Creates a new `DelayedJobScheduler`
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            queue,
            clock,
            retry,
        }
    }

    /// Enqueue `kind` for `uuid` as part of `uow`.
    ///
    /// The job commits or rolls back with the unit, so a worker never sees a
    /// deadline for an order that was not stored.
    ///
    /// # Errors
    ///
    /// - `Queue` if `delay` overflows the clock
    /// - `Store` if the unit rejects the insert
    pub async fn schedule_within(
        &self,
        uow: &mut dyn UnitOfWork,
        kind: JobKind,
        uuid: TransactionId,
        delay: Duration,
    ) -> Result<(), EngineError> {
        let request = self.request(kind, uuid, delay)?;
        uow.enqueue_job(&request).await?;
        tracing::debug!(%uuid, %kind, run_at = %request.run_at, "Job enqueued");
        Ok(())
    }

    fn request(
        &self,
        kind: JobKind,
        uuid: TransactionId,
        delay: Duration,
    ) -> Result<JobRequest, QueueError> {
        let run_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| self.clock.now().checked_add_signed(delta))
            .ok_or(QueueError::DelayOutOfRange(delay))?;

        Ok(JobRequest {
            kind,
            payload: JobPayload { uuid },
            run_at,
            max_attempts: self.retry.max_attempts,
            backoff: self.retry.initial_delay,
        })
    }

    /// Remove the pending `kind` job for `uuid`.
    ///
    /// Returns whether a job was removed; a job that already ran or never
    /// existed is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the queue is unreachable.
    pub async fn cancel(&self, kind: JobKind, uuid: TransactionId) -> Result<bool, QueueError> {
        let removed = self.queue.cancel(JobKey { kind, uuid }).await?;
        tracing::debug!(%uuid, %kind, removed, "Job cancelled");
        Ok(removed)
    }

    /// Cancel without failing; errors are logged.
    pub async fn cancel_quietly(&self, kind: JobKind, uuid: TransactionId) {
        if let Err(error) = self.cancel(kind, uuid).await {
            tracing::warn!(%uuid, %kind, %error, "Failed to cancel job");
        }
    }
}

impl std::fmt::Debug for DelayedJobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedJobScheduler")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
