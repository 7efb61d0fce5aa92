//! Append-only job lifecycle audit log.
//!
//! Events are facts about state transitions observed by the dispatcher.
//! They are inserted, never updated or deleted. A failed event write is
//! logged and swallowed; the audit log must never take a dispatch down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use super::processors::RunSummary;

/// Why a job went back to `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    /// Job-level retry after a processor failure.
    Retry,
    /// Lease abandoned by a crashed worker and swept.
    StaleLock,
    /// Interrupted by a timed-out graceful shutdown.
    Shutdown,
}

/// Job lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Started {
        attempt: i32,
    },
    Completed {
        summary: RunSummary,
    },
    Failed {
        error: String,
        attempt: i32,
    },
    Requeued {
        reason: RequeueReason,
        attempts: i32,
    },
    Skipped {
        job_type: String,
    },
}

impl JobEvent {
    /// The `event_type` column value for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "job_started",
            JobEvent::Completed { .. } => "job_completed",
            JobEvent::Failed { .. } => "job_failed",
            JobEvent::Requeued { .. } => "job_requeued",
            JobEvent::Skipped { .. } => "job_skipped",
        }
    }

    /// The structured payload stored alongside the event type.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            JobEvent::Started { attempt } => serde_json::json!({ "attempt": attempt }),
            JobEvent::Completed { summary } => {
                serde_json::json!({ "summary": summary })
            }
            JobEvent::Failed { error, attempt } => {
                serde_json::json!({ "error": error, "attempt": attempt })
            }
            JobEvent::Requeued { reason, attempts } => {
                serde_json::json!({ "reason": reason, "attempts": attempts })
            }
            JobEvent::Skipped { job_type } => serde_json::json!({ "job_type": job_type }),
        }
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobEventRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append an event for a job.
pub async fn append(pool: &PgPool, job_id: Uuid, event: &JobEvent) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_events (id, job_id, event_type, payload, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(event.event_type())
    .bind(event.payload())
    .execute(pool)
    .await?;

    Ok(())
}

/// Append an event, logging instead of propagating on failure.
pub async fn record(pool: &PgPool, job_id: Uuid, event: &JobEvent) {
    if let Err(e) = append(pool, job_id, event).await {
        error!(
            job_id = %job_id,
            event_type = event.event_type(),
            error = %e,
            "failed to append job event"
        );
    }
}

/// All events for a job, oldest first.
pub async fn for_job(pool: &PgPool, job_id: Uuid) -> anyhow::Result<Vec<JobEventRow>> {
    let rows = sqlx::query_as::<_, JobEventRow>(
        r#"
        SELECT id, job_id, event_type, payload, created_at
        FROM job_events
        WHERE job_id = $1
        ORDER BY created_at ASC, id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings_match_the_log_schema() {
        assert_eq!(JobEvent::Started { attempt: 1 }.event_type(), "job_started");
        assert_eq!(
            JobEvent::Completed {
                summary: RunSummary::default()
            }
            .event_type(),
            "job_completed"
        );
        assert_eq!(
            JobEvent::Failed {
                error: "boom".to_string(),
                attempt: 2
            }
            .event_type(),
            "job_failed"
        );
        assert_eq!(
            JobEvent::Requeued {
                reason: RequeueReason::Retry,
                attempts: 1
            }
            .event_type(),
            "job_requeued"
        );
        assert_eq!(
            JobEvent::Skipped {
                job_type: "mystery".to_string()
            }
            .event_type(),
            "job_skipped"
        );
    }

    #[test]
    fn requeue_payload_carries_reason() {
        let event = JobEvent::Requeued {
            reason: RequeueReason::StaleLock,
            attempts: 2,
        };
        let payload = event.payload();
        assert_eq!(payload["reason"], "stale_lock");
        assert_eq!(payload["attempts"], 2);
    }

    #[test]
    fn failed_payload_carries_error_text() {
        let event = JobEvent::Failed {
            error: "portal unreachable".to_string(),
            attempt: 3,
        };
        let payload = event.payload();
        assert_eq!(payload["error"], "portal unreachable");
    }
}
