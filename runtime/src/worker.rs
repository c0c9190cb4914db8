//! Polling worker that runs due jobs.
//!
//! Each tick leases a batch of due jobs and runs their handlers with bounded
//! concurrency:
//!
//! - success: the job is deleted;
//! - failure: the job is rescheduled after `backoff × 2^(attempt−1)`;
//! - failure number `max_attempts`, or no handler for the kind: the job moves
//!   to the dead-letter store.
//!
//! A job leased by a worker that dies before finishing becomes due again when
//! its lease expires.

use crate::handlers::HandlerRegistry;
use crate::metrics::{JobMetrics, JobOutcome};
use crate::retry::RetryPolicy;
use boxoffice_core::environment::Clock;
use boxoffice_core::jobs::{JobQueue, QueueError, ScheduledJob};
use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Polling and leasing settings of a [`JobWorker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Pause between polls when the queue has nothing due
    pub poll_interval: Duration,
    /// Jobs leased per poll
    pub batch_size: usize,
    /// Handlers running at once
    pub concurrency: usize,
    /// How long a leased job stays invisible to other workers
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 32,
            concurrency: 8,
            lease: Duration::from_secs(5 * 60),
        }
    }
}

/// What one [`JobWorker::run_once`] call did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs leased
    pub claimed: usize,
    /// Jobs completed and removed
    pub completed: usize,
    /// Jobs rescheduled after a failure
    pub retried: usize,
    /// Jobs moved to the dead-letter store
    pub dead_lettered: usize,
    /// Jobs whose outcome could not be recorded; they reappear after the lease
    pub unrecorded: usize,
}

/// Runs due jobs from a [`JobQueue`] through a [`HandlerRegistry`]
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl JobWorker {
    /// Creates a new `JobWorker`
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            clock,
            config,
        }
    }

    /// Lease and run one batch of due jobs.
    ///
    /// # Errors
    ///
    /// Returns the queue error if the batch could not be leased. Failures
    /// while recording a single job's outcome are logged and counted as
    /// `unrecorded`.
    pub async fn run_once(&self) -> Result<TickSummary, QueueError> {
        let now = self.clock.now();
        let lease_until = after(now, self.config.lease)?;
        let jobs = self
            .queue
            .claim_due(now, self.config.batch_size.max(1), lease_until)
            .await?;

        let mut summary = TickSummary {
            claimed: jobs.len(),
            ..TickSummary::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }

        let outcomes: Vec<_> = stream::iter(jobs)
            .map(|job| self.process(job))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Some(JobOutcome::Completed) => summary.completed += 1,
                Some(JobOutcome::Retried) => summary.retried += 1,
                Some(JobOutcome::DeadLettered) => summary.dead_lettered += 1,
                None => summary.unrecorded += 1,
            }
        }

        tracing::debug!(
            claimed = summary.claimed,
            completed = summary.completed,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            "Worker tick finished"
        );
        Ok(summary)
    }

    /// Poll until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A full batch is followed by another poll without pausing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            kinds = ?self.registry.kinds().collect::<Vec<_>>(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Job worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained = match self.run_once().await {
                Ok(summary) => summary.claimed < self.config.batch_size.max(1),
                Err(error) => {
                    tracing::error!(%error, "Failed to claim jobs");
                    true
                },
            };
            if !drained {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }

        tracing::info!("Job worker stopped");
    }

    async fn process(&self, job: ScheduledJob) -> Option<JobOutcome> {
        let started = Instant::now();
        let key = job.key();

        let result = match self.registry.get(job.kind) {
            Some(handler) => match handler.handle(&job).await {
                Ok(outcome) => {
                    tracing::debug!(job = %key, ?outcome, "Job handled");
                    self.queue
                        .complete(job.id)
                        .await
                        .map(|()| JobOutcome::Completed)
                },
                Err(error) => self.fail(&job, &error.to_string(), false).await,
            },
            None => {
                let error = format!("no handler registered for {}", job.kind);
                self.fail(&job, &error, true).await
            },
        };

        match result {
            Ok(outcome) => {
                JobMetrics::record_execution(job.kind, outcome, started.elapsed());
                Some(outcome)
            },
            Err(error) => {
                tracing::error!(job = %key, %error, "Failed to record job outcome");
                None
            },
        }
    }

    async fn fail(
        &self,
        job: &ScheduledJob,
        error: &str,
        permanent: bool,
    ) -> Result<JobOutcome, QueueError> {
        let attempts = job.attempts + 1;
        let policy = RetryPolicy::for_job(job);
        let now = self.clock.now();

        if !permanent && policy.allows_retry_after(attempts) {
            let delay = policy.delay_for_attempt(attempts - 1);
            let run_at = after(now, delay)?;
            self.queue.retry_later(job.id, attempts, run_at, error).await?;
            tracing::warn!(
                job = %job.key(),
                attempts,
                retry_in_ms = delay.as_millis(),
                %error,
                "Job failed, retrying"
            );
            return Ok(JobOutcome::Retried);
        }

        let mut failed = job.clone();
        failed.attempts = attempts;
        failed.last_error = Some(error.to_string());
        self.queue.dead_letter(&failed, error, now).await?;
        tracing::error!(
            job = %job.key(),
            attempts,
            %error,
            "Job moved to dead-letter store"
        );
        Ok(JobOutcome::DeadLettered)
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, QueueError> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(QueueError::DelayOutOfRange(delay))
}
