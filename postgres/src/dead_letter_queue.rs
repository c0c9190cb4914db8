//! Dead Letter Queue (DLQ) for failed jobs.
//!
//! Jobs that exhausted their retries, or that no handler could run, are moved
//! out of `scheduled_jobs` into `failed_jobs`. Operators list them, annotate
//! them, and either discard them or put them back on the queue.

use crate::queue::{backend, backoff_from_db, backoff_to_db, col, from_i32, to_i32};
use boxoffice_core::jobs::{DeadLetter, JobId, JobKind, JobPayload, QueueError, ScheduledJob};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use uuid::Uuid;

const FAILED_JOB_COLUMNS: &str = r"
    id, job_id, kind, payload, run_at, max_attempts, backoff_ms, job_created_at,
    error_message, error_details, attempts, first_failed_at, last_failed_at,
    status, resolved_at, resolved_by, resolution_notes
";

/// Status of a failed job in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Job is pending investigation
    Pending,
    /// An operator is looking at it
    Processing,
    /// Job was requeued or otherwise fixed
    Resolved,
    /// Job was permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(QueueError::Corrupt(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The job as it was when it failed for the last time
    pub job: ScheduledJob,

    /// Error message from the last failure
    pub error_message: String,

    /// Full error details, if any were recorded
    pub error_details: Option<String>,

    /// When the job was moved here
    pub first_failed_at: DateTime<Utc>,

    /// Last status change
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

impl FailedJob {
    /// The queue-level view of this entry
    #[must_use]
    pub fn into_dead_letter(self) -> DeadLetter {
        DeadLetter {
            job: self.job,
            error: self.error_message,
            failed_at: self.first_failed_at,
        }
    }
}

/// `PostgreSQL`-based Dead Letter Queue for failed jobs.
///
/// # Example
///
/// ```no_run
/// use boxoffice_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// if let Some(failed) = pending.first() {
///     dlq.update_status(failed.id, DLQStatus::Processing).await?;
///     dlq.requeue(failed.id, chrono::Utc::now()).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Move `job` out of `scheduled_jobs` into the DLQ in one statement.
    ///
    /// Returns the id of the new DLQ entry.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the job is no longer scheduled
    /// - [`QueueError::Backend`] if the statement fails
    pub async fn bury(
        &self,
        job: &ScheduledJob,
        error_message: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<i64, QueueError> {
        let payload = serde_json::to_value(job.payload)
            .map_err(|e| QueueError::Corrupt(e.to_string()))?;

        let id: Option<i64> = sqlx::query_scalar(
            r"
            WITH moved AS (
                DELETE FROM scheduled_jobs WHERE id = $1
                RETURNING id, kind, run_at, max_attempts, backoff_ms, created_at
            )
            INSERT INTO failed_jobs (
                job_id, kind, payload, run_at, max_attempts, backoff_ms, job_created_at,
                error_message, attempts, first_failed_at, last_failed_at
            )
            SELECT id, kind, $2, run_at, max_attempts, backoff_ms, created_at, $3, $4, $5, $5
            FROM moved
            RETURNING id
            ",
        )
        .bind(*job.id.as_uuid())
        .bind(payload)
        .bind(error_message)
        .bind(to_i32(job.attempts)?)
        .bind(failed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let id = id.ok_or(QueueError::JobNotFound(job.id))?;

        tracing::warn!(
            dlq_id = id,
            job = %job.key(),
            attempts = job.attempts,
            error = error_message,
            "Job added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending failed jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedJob>, QueueError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed jobs by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedJob>, QueueError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(&format!(
            r"
            SELECT {FAILED_JOB_COLUMNS}
            FROM failed_jobs
            WHERE status = $1
            ORDER BY first_failed_at ASC, id ASC
            LIMIT $2
            "
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(Self::row_to_failed_job).collect()
    }

    /// Get a specific failed job by DLQ id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<FailedJob>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {FAILED_JOB_COLUMNS} FROM failed_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(Self::row_to_failed_job).transpose()
    }

    /// Update the status of a failed job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), QueueError> {
        sqlx::query(
            r"
            UPDATE failed_jobs
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a failed job as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r"
            UPDATE failed_jobs
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("boxoffice_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark a failed job as discarded; it will not run again.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        sqlx::query(
            r"
            UPDATE failed_jobs
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("boxoffice_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Put an unresolved entry back on the queue with a fresh attempt budget.
    ///
    /// If a live job with the same key already exists, that job is kept and
    /// its id returned. The entry is marked resolved either way. Returns
    /// `None` if the entry does not exist or is already resolved or discarded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if any statement fails; nothing changes.
    pub async fn requeue(
        &self,
        id: i64,
        run_at: DateTime<Utc>,
    ) -> Result<Option<JobId>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(&format!(
            r"
            SELECT {FAILED_JOB_COLUMNS} FROM failed_jobs
            WHERE id = $1 AND status IN ('pending', 'processing')
            FOR UPDATE
            "
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let failed = Self::row_to_failed_job(&row)?;
        let job = &failed.job;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO scheduled_jobs (id, kind, transaction_uuid, run_at, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, transaction_uuid) DO NOTHING
            RETURNING id
            ",
        )
        .bind(Uuid::new_v4())
        .bind(job.kind.as_str())
        .bind(*job.payload.uuid.as_uuid())
        .bind(run_at)
        .bind(to_i32(job.max_attempts)?)
        .bind(backoff_to_db(job.backoff)?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let job_id = match inserted {
            Some(job_id) => job_id,
            None => sqlx::query_scalar(
                "SELECT id FROM scheduled_jobs WHERE kind = $1 AND transaction_uuid = $2",
            )
            .bind(job.kind.as_str())
            .bind(*job.payload.uuid.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?,
        };

        sqlx::query(
            r"
            UPDATE failed_jobs
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = 'requeue',
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(format!("requeued as job {job_id}"))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        tracing::info!(dlq_id = id, job = %job.key(), %job_id, "DLQ entry requeued");
        metrics::counter!("boxoffice_dlq_requeued_total").increment(1);

        Ok(Some(JobId::from_uuid(job_id)))
    }

    /// Get count of pending failures.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM failed_jobs
            WHERE status = 'pending'
            ",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(count)
    }

    /// Convert a database row to a `FailedJob`.
    fn row_to_failed_job(row: &PgRow) -> Result<FailedJob, QueueError> {
        let kind: String = col(row, "kind")?;
        let kind: JobKind = kind.parse()?;
        let payload: serde_json::Value = col(row, "payload")?;
        let payload: JobPayload =
            serde_json::from_value(payload).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        let status: String = col(row, "status")?;
        let error_message: String = col(row, "error_message")?;

        Ok(FailedJob {
            id: col(row, "id")?,
            job: ScheduledJob {
                id: JobId::from_uuid(col(row, "job_id")?),
                kind,
                payload,
                run_at: col(row, "run_at")?,
                attempts: from_i32(col(row, "attempts")?)?,
                max_attempts: from_i32(col(row, "max_attempts")?)?,
                backoff: backoff_from_db(col(row, "backoff_ms")?)?,
                last_error: Some(error_message.clone()),
                created_at: col(row, "job_created_at")?,
            },
            error_message,
            error_details: col(row, "error_details")?,
            first_failed_at: col(row, "first_failed_at")?,
            last_failed_at: col(row, "last_failed_at")?,
            status: DLQStatus::parse(&status)?,
            resolved_at: col(row, "resolved_at")?,
            resolved_by: col(row, "resolved_by")?,
            resolution_notes: col(row, "resolution_notes")?,
        })
    }
}
