//! In-memory delayed-job queue.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use boxoffice_core::jobs::{
    DeadLetter, JobId, JobKey, JobQueue, JobRequest, QueueError, ScheduledJob,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Entry {
    job: ScheduledJob,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Entry>,
    dead: Vec<DeadLetter>,
    cancelled: Vec<JobKey>,
    fail_schedule_after: Option<usize>,
}

/// In-memory [`JobQueue`] with failure injection and inspection
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryJobQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the next `successes` schedule calls through, then fail exactly one
    pub fn fail_schedule_after(&self, successes: usize) {
        self.state.lock().unwrap().fail_schedule_after = Some(successes);
    }

    /// Every live job (pending or leased), earliest first
    #[must_use]
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.run_at);
        jobs
    }

    /// The live job for `key`
    #[must_use]
    pub fn find(&self, key: JobKey) -> Option<ScheduledJob> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|entry| entry.job.key() == key)
            .map(|entry| entry.job.clone())
    }

    /// Number of live jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether no job is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys removed through [`JobQueue::cancel`]
    #[must_use]
    pub fn cancelled(&self) -> Vec<JobKey> {
        self.state.lock().unwrap().cancelled.clone()
    }

    /// Dead-lettered jobs, oldest first
    #[must_use]
    pub fn dead(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap().dead.clone()
    }

    /// Force `key`'s job to be due at `run_at`
    pub fn reschedule(&self, key: JobKey, run_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.iter_mut().find(|entry| entry.job.key() == key) {
            entry.job.run_at = run_at;
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn schedule(&self, request: JobRequest) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.fail_schedule_after {
            if remaining == 0 {
                state.fail_schedule_after = None;
                return Err(QueueError::Backend("injected schedule failure".into()));
            }
            state.fail_schedule_after = Some(remaining - 1);
        }

        let key = request.key();
        if let Some(existing) = state.entries.iter().find(|entry| entry.job.key() == key) {
            return Ok(existing.job.id);
        }

        let job = ScheduledJob {
            id: JobId::new(),
            kind: request.kind,
            payload: request.payload,
            run_at: request.run_at,
            attempts: 0,
            max_attempts: request.max_attempts,
            backoff: request.backoff,
            last_error: None,
            created_at: Utc::now(),
        };
        let id = job.id;
        state.entries.push(Entry {
            job,
            leased_until: None,
        });
        Ok(id)
    }

    async fn cancel(&self, key: JobKey) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state
            .entries
            .retain(|entry| entry.job.key() != key || entry.leased_until.is_some());
        let removed = state.entries.len() < before;
        if removed {
            state.cancelled.push(key);
        }
        Ok(removed)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<&mut Entry> = state
            .entries
            .iter_mut()
            .filter(|entry| entry.job.run_at <= now)
            .filter(|entry| entry.leased_until.is_none_or(|until| until <= now))
            .collect();
        due.sort_by_key(|entry| entry.job.run_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.leased_until = Some(lease_until);
                entry.job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.job.id != id);
        if state.entries.len() == before {
            return Err(QueueError::JobNotFound(id));
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        id: JobId,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|entry| entry.job.id == id)
            .ok_or(QueueError::JobNotFound(id))?;
        entry.job.attempts = attempts;
        entry.job.run_at = run_at;
        entry.job.last_error = Some(error.to_string());
        entry.leased_until = None;
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &ScheduledJob,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.job.id != job.id);
        if state.entries.len() == before {
            return Err(QueueError::JobNotFound(job.id));
        }
        state.dead.push(DeadLetter {
            job: job.clone(),
            error: error.to_string(),
            failed_at,
        });
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dead
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}
