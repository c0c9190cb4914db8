//! Delayed-job model and the durable queue port.
//!
//! A job is keyed by `(kind, transaction uuid)`; at most one live job exists
//! per key. Delivery is at-least-once, so every handler re-checks the
//! transaction's status before mutating anything.

use crate::types::TransactionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// What a deferred job does when it fires
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Payment deadline: expire an unpaid transaction
    ExpireTransaction,
    /// Organizer response deadline: cancel an unanswered transaction
    OrganizationResponse,
    /// Reminder sent some days after acceptance
    OrganizerFollowup,
}

impl JobKind {
    /// Every kind
    pub const ALL: [Self; 3] = [
        Self::ExpireTransaction,
        Self::OrganizationResponse,
        Self::OrganizerFollowup,
    ];

    /// Queue / database representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExpireTransaction => "expire-transaction",
            Self::OrganizationResponse => "organization-response",
            Self::OrganizerFollowup => "organizer-followup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::Corrupt(format!("unknown job kind: {s}")))
    }
}

/// Identity of a scheduled job row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random `JobId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `JobId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deduplication key of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobKey {
    /// Job kind
    pub kind: JobKind,
    /// Transaction the job acts on
    pub uuid: TransactionId,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.uuid)
    }
}

/// Job payload, stored as JSON
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Transaction the job acts on
    pub uuid: TransactionId,
}

/// A request to enqueue a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    /// Job kind
    pub kind: JobKind,
    /// Payload
    pub payload: JobPayload,
    /// Earliest execution time
    pub run_at: DateTime<Utc>,
    /// Total attempts before dead-lettering
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
}

impl JobRequest {
    /// Deduplication key
    #[must_use]
    pub const fn key(&self) -> JobKey {
        JobKey {
            kind: self.kind,
            uuid: self.payload.uuid,
        }
    }
}

/// A job as stored in the queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledJob {
    /// Row identity
    pub id: JobId,
    /// Job kind
    pub kind: JobKind,
    /// Payload
    pub payload: JobPayload,
    /// Earliest next execution time
    pub run_at: DateTime<Utc>,
    /// Failed attempts so far
    pub attempts: u32,
    /// Total attempts before dead-lettering
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff: Duration,
    /// Error of the most recent failed attempt
    pub last_error: Option<String>,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Deduplication key
    #[must_use]
    pub const fn key(&self) -> JobKey {
        JobKey {
            kind: self.kind,
            uuid: self.payload.uuid,
        }
    }
}

/// A job that exhausted its attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// The job as it was when it failed for the last time
    pub job: ScheduledJob,
    /// Final error
    pub error: String,
    /// When it was dead-lettered
    pub failed_at: DateTime<Utc>,
}

/// Errors from the job queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Backend operation failed
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// Stored job could not be decoded
    #[error("Corrupt job: {0}")]
    Corrupt(String),

    /// Delay does not fit the clock's range
    #[error("Delay out of range: {0:?}")]
    DelayOutOfRange(Duration),

    /// Job does not exist (already completed or cancelled)
    #[error("Job {0} not found")]
    JobNotFound(JobId),
}

/// Durable delayed-job queue with keyed cancellation and leasing.
///
/// `claim_due` hands out jobs with a lease; a job whose lease expires before
/// it is completed, retried or dead-lettered becomes claimable again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. If a live job with the same key exists, its id is
    /// returned and nothing is enqueued.
    async fn schedule(&self, request: JobRequest) -> Result<JobId, QueueError>;

    /// Remove the pending job with this key. Returns whether one was removed.
    /// Jobs already claimed by a worker are left alone.
    async fn cancel(&self, key: JobKey) -> Result<bool, QueueError>;

    /// Lease up to `limit` jobs due at `now` until `lease_until`
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, QueueError>;

    /// Remove a successfully handled job
    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Return a failed job to the queue with its updated attempt count
    async fn retry_later(
        &self,
        id: JobId,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Move a job to the dead-letter store
    async fn dead_letter(
        &self,
        job: &ScheduledJob,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Dead-lettered jobs awaiting an operator, oldest first
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!("send-invoice".parse::<JobKind>().is_err());
    }

    #[test]
    fn key_formats_like_queue_job_id() {
        let uuid = TransactionId::new();
        let key = JobKey {
            kind: JobKind::ExpireTransaction,
            uuid,
        };
        assert_eq!(key.to_string(), format!("expire-transaction:{uuid}"));
    }

    #[test]
    fn payload_is_uuid_object() {
        let uuid = TransactionId::new();
        let json = serde_json::to_value(JobPayload { uuid }).unwrap();
        assert_eq!(json, serde_json::json!({ "uuid": uuid.to_string() }));
    }
}
