//! Status and progress writes owned by the dispatcher.
//!
//! Terminal status writes also clear the lease fields, so a completed job
//! can never be claimed again by a racing sweep. Everything here is a
//! single conditional UPDATE.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Marker recorded on jobs requeued by a timed-out graceful shutdown.
pub const SHUTDOWN_INTERRUPT_MARKER: &str = "interrupted by shutdown";

/// Set the total number of sub-targets for a running job.
///
/// `progress_completed` is deliberately preserved so a requeued job still
/// shows how far the previous attempt got.
pub async fn init_progress(pool: &PgPool, job_id: Uuid, total: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET progress_total = $2,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(total)
    .execute(pool)
    .await?;

    Ok(())
}

/// Advance the completed-sub-target counter. Monotone while running; only
/// the lease holder ever calls this.
pub async fn update_progress(pool: &PgPool, job_id: Uuid, completed: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET progress_completed = GREATEST(progress_completed, $2),
            updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(completed)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal success: clears lock fields and `last_error`, stamps
/// `completed_at`.
pub async fn mark_succeeded(pool: &PgPool, job_id: Uuid, attempts: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'succeeded',
            attempts = $2,
            last_error = NULL,
            lock_token = NULL,
            locked_at = NULL,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(attempts)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal failure: retains the captured error, leaves `run_at` untouched.
pub async fn mark_failed(pool: &PgPool, job_id: Uuid, attempts: i32, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed',
            attempts = $2,
            last_error = $3,
            lock_token = NULL,
            locked_at = NULL,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(attempts)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Job-level retry: back to `queued` with a fixed delay.
///
/// Sub-target progress restarts from scratch on retry; partial state is not
/// guaranteed consistent across processor attempts.
pub async fn requeue_for_retry(
    pool: &PgPool,
    job_id: Uuid,
    attempts: i32,
    error: &str,
    run_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'queued',
            attempts = $2,
            last_error = $3,
            run_at = $4,
            progress_completed = 0,
            lock_token = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(attempts)
    .bind(error)
    .bind(run_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Shutdown path: requeue an interrupted job for immediate pickup by
/// another worker.
///
/// Conditional on the job still being `running`, so a dispatch that raced
/// to a terminal status just before the grace period expired is left alone.
/// Interruption is an operational event, not a job-intrinsic failure, so
/// `attempts` is not touched.
pub async fn requeue_interrupted(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'queued',
            last_error = $2,
            run_at = NOW(),
            lock_token = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(SHUTDOWN_INTERRUPT_MARKER)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
