//! Durable delayed-job queue.

use crate::dead_letter_queue::DeadLetterQueue;
use async_trait::async_trait;
use boxoffice_core::jobs::{
    DeadLetter, JobId, JobKey, JobPayload, JobQueue, JobRequest, QueueError, ScheduledJob,
};
use boxoffice_core::types::TransactionId;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

const JOB_COLUMNS: &str = r"
    id, kind, transaction_uuid, run_at, attempts, max_attempts, backoff_ms,
    last_error, created_at
";

/// `PostgreSQL` implementation of [`JobQueue`].
///
/// Jobs live in `scheduled_jobs` until they complete or are moved to
/// `failed_jobs`. A unique index on `(kind, transaction_uuid)` keeps at most
/// one live job per key. Claiming flips rows to `running` with a lease; rows
/// whose lease expired are claimable again.
#[derive(Clone, Debug)]
pub struct PostgresJobQueue {
    pool: PgPool,
    dead: DeadLetterQueue,
}

impl PostgresJobQueue {
    /// Create a queue over `pool`
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            dead: DeadLetterQueue::new(pool.clone()),
            pool,
        }
    }

    /// The dead-letter store this queue writes to
    #[must_use]
    pub const fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dead
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn schedule(&self, request: JobRequest) -> Result<JobId, QueueError> {
        let uuid = *request.payload.uuid.as_uuid();
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO scheduled_jobs (id, kind, transaction_uuid, run_at, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, transaction_uuid) DO NOTHING
            RETURNING id
            ",
        )
        .bind(Uuid::new_v4())
        .bind(request.kind.as_str())
        .bind(uuid)
        .bind(request.run_at)
        .bind(to_i32(request.max_attempts)?)
        .bind(backoff_to_db(request.backoff)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let id = match inserted {
            Some(id) => id,
            None => {
                tracing::debug!(key = %request.key(), "Job already scheduled");
                sqlx::query_scalar(
                    "SELECT id FROM scheduled_jobs WHERE kind = $1 AND transaction_uuid = $2",
                )
                .bind(request.kind.as_str())
                .bind(uuid)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?
            },
        };

        Ok(JobId::from_uuid(id))
    }

    async fn cancel(&self, key: JobKey) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r"
            DELETE FROM scheduled_jobs
            WHERE kind = $1 AND transaction_uuid = $2 AND status = 'pending'
            ",
        )
        .bind(key.kind.as_str())
        .bind(*key.uuid.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, QueueError> {
        #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
        let rows = sqlx::query(&format!(
            r"
            UPDATE scheduled_jobs SET status = 'running', locked_until = $3
            WHERE id IN (
                SELECT id FROM scheduled_jobs
                WHERE run_at <= $1
                  AND (status = 'pending' OR locked_until <= $1)
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| job.run_at);
        Ok(jobs)
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
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
        let result = sqlx::query(
            r"
            UPDATE scheduled_jobs
            SET attempts = $2, run_at = $3, last_error = $4,
                status = 'pending', locked_until = NULL
            WHERE id = $1
            ",
        )
        .bind(*id.as_uuid())
        .bind(to_i32(attempts)?)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &ScheduledJob,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.dead.bury(job, error, failed_at).await.map(|_| ())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self
            .dead
            .list_pending(limit)
            .await?
            .into_iter()
            .map(|failed| failed.into_dead_letter())
            .collect())
    }
}

pub(crate) fn row_to_job(row: &PgRow) -> Result<ScheduledJob, QueueError> {
    let kind: String = col(row, "kind")?;
    let last_error: Option<String> = col(row, "last_error")?;
    Ok(ScheduledJob {
        id: JobId::from_uuid(col(row, "id")?),
        kind: kind.parse()?,
        payload: JobPayload {
            uuid: TransactionId::from_uuid(col(row, "transaction_uuid")?),
        },
        run_at: col(row, "run_at")?,
        attempts: from_i32(col(row, "attempts")?)?,
        max_attempts: from_i32(col(row, "max_attempts")?)?,
        backoff: backoff_from_db(col(row, "backoff_ms")?)?,
        last_error,
        created_at: col(row, "created_at")?,
    })
}

pub(crate) fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, QueueError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| QueueError::Corrupt(format!("{name}: {e}")))
}

pub(crate) fn to_i32(value: u32) -> Result<i32, QueueError> {
    i32::try_from(value).map_err(|_| QueueError::Corrupt(format!("{value} out of range")))
}

pub(crate) fn from_i32(value: i32) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::Corrupt(format!("negative counter {value}")))
}

pub(crate) fn backoff_to_db(backoff: Duration) -> Result<i64, QueueError> {
    i64::try_from(backoff.as_millis()).map_err(|_| QueueError::DelayOutOfRange(backoff))
}

pub(crate) fn backoff_from_db(millis: i64) -> Result<Duration, QueueError> {
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| QueueError::Corrupt(format!("negative backoff {millis}")))
}

pub(crate) fn backend(error: sqlx::Error) -> QueueError {
    QueueError::Backend(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_round_trips_through_millis() {
        let backoff = Duration::from_millis(1500);
        assert_eq!(backoff_from_db(backoff_to_db(backoff).unwrap_or_default()).ok(), Some(backoff));
        assert!(backoff_from_db(-5).is_err());
    }

    #[test]
    fn counters_must_fit_i32() {
        assert_eq!(to_i32(3).ok(), Some(3));
        assert!(to_i32(u32::MAX).is_err());
        assert!(from_i32(-1).is_err());
    }
}
