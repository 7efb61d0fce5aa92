//! Job leasing.
//!
//! All cross-process mutual exclusion lives here. Every lease transition is
//! a single atomic conditional update at the store boundary; there is no
//! read-then-write anywhere in this module.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::events::{self, JobEvent, RequeueReason};
use super::job::{Job, JOB_COLUMNS};

pub struct LeaseManager {
    pool: PgPool,
    lock_timeout: Duration,
}

impl LeaseManager {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Atomically claim the next eligible job, if any.
    ///
    /// Eligible means `status = queued`, `run_at <= now`, unlocked; ordered
    /// by priority descending then earliest `run_at`. Exactly one concurrent
    /// caller can win a given job; losers simply see no row. An empty queue
    /// and a lost race are indistinguishable to the caller, by design.
    pub async fn reserve_next_job(&self) -> Result<Option<Job>> {
        let lock_token = Uuid::new_v4();
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND run_at <= NOW()
                  AND lock_token IS NULL
                ORDER BY priority DESC, run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                lock_token = $1,
                locked_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(lock_token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Unconditionally clear the lease fields for a job. Idempotent; called
    /// as guaranteed cleanup after every dispatch regardless of outcome.
    pub async fn release_job_lock(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lock_token = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recover jobs orphaned by a crashed worker.
    ///
    /// Any job still `running` whose lease is older than the lock timeout
    /// reverts to `queued` with its lock cleared. Returns the number of
    /// recovered jobs. The dispatcher throttles this to a multi-minute
    /// cadence rather than running it on every poll.
    pub async fn cleanup_stale_locks(&self) -> Result<u64> {
        let recovered: Vec<(Uuid, String, i32)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'queued',
                lock_token = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND locked_at IS NOT NULL
              AND locked_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            RETURNING id, job_type, attempts
            "#,
        )
        .bind(self.lock_timeout.as_millis().to_string())
        .fetch_all(&self.pool)
        .await?;

        for (job_id, job_type, attempts) in &recovered {
            warn!(
                job_id = %job_id,
                job_type = %job_type,
                "recovered job with stale lock"
            );
            events::record(
                &self.pool,
                *job_id,
                &JobEvent::Requeued {
                    reason: RequeueReason::StaleLock,
                    attempts: *attempts,
                },
            )
            .await;
        }

        Ok(recovered.len() as u64)
    }
}
