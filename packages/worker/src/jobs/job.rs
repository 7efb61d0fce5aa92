//! Job model for background work.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Column list shared by every query returning a full job row.
pub(crate) const JOB_COLUMNS: &str = "id, job_type, payload, status, priority, attempts, \
     max_attempts, lock_token, locked_at, run_at, progress_total, progress_completed, \
     last_error, created_at, updated_at, completed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Terminal state reserved for external intervention; the worker loop
    /// never sets it.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The job types this worker knows how to dispatch.
///
/// The row stores the tag as text; unknown tags are handled explicitly by
/// the dispatcher (`job_skipped` + `failed`), never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Look up contractor license records on the state agency portal.
    LicenseLookup,
    /// Re-sync open case state from the portal.
    CaseSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::LicenseLookup => "license_lookup",
            JobType::CaseSync => "case_sync",
        }
    }

    pub fn from_str(tag: &str) -> Option<Self> {
        match tag {
            "license_lookup" => Some(JobType::LicenseLookup),
            "case_sync" => Some(JobType::CaseSync),
            _ => None,
        }
    }
}

/// Payload for `license_lookup` jobs: license numbers to look up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupPayload {
    pub targets: Vec<String>,
}

/// Payload for `case_sync` jobs: case ids to re-sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSyncPayload {
    pub targets: Vec<Uuid>,
}

/// A unit of background work.
///
/// At most one worker holds a non-null `lock_token` for a given job at any
/// time; a job is only claimable while `status = queued`, `run_at <= now`,
/// and `lock_token` is null.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_type: String,

    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Higher claims first, ties broken by earliest `run_at`.
    #[builder(default = 0)]
    pub priority: i32,

    /// Whole-job attempts recorded so far (distinct from operation-level
    /// retries inside a processor).
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    // Lease fields; non-null means a worker currently owns the job.
    #[builder(default, setter(strip_option))]
    pub lock_token: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,

    /// Earliest time the job may be claimed.
    #[builder(default = Utc::now())]
    pub run_at: DateTime<Utc>,

    #[builder(default = 0)]
    pub progress_total: i32,
    #[builder(default = 0)]
    pub progress_completed: i32,

    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Convenience constructor for an immediately runnable job.
    pub fn immediate(job_type: JobType, payload: serde_json::Value) -> Self {
        Self::builder()
            .job_type(job_type.as_str())
            .payload(payload)
            .build()
    }

    /// Mirror of the SQL claim predicate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.run_at <= now && self.lock_token.is_none()
    }

    pub fn parsed_type(&self) -> Option<JobType> {
        JobType::from_str(&self.job_type)
    }

    /// Number of sub-targets declared by the payload, if any.
    pub fn target_count(&self) -> Option<usize> {
        self.payload
            .get("targets")
            .and_then(|value| value.as_array())
            .map(|targets| targets.len())
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority, attempts, max_attempts,
                lock_token, locked_at, run_at, progress_total, progress_completed,
                last_error, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(self.id)
            .bind(&self.job_type)
            .bind(&self.payload)
            .bind(self.status)
            .bind(self.priority)
            .bind(self.attempts)
            .bind(self.max_attempts)
            .bind(self.lock_token)
            .bind(self.locked_at)
            .bind(self.run_at)
            .bind(self.progress_total)
            .bind(self.progress_completed)
            .bind(&self.last_error)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.completed_at)
            .fetch_one(pool)
            .await?;

        Ok(job)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Self>(&sql).bind(id).fetch_one(pool).await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::immediate(
            JobType::LicenseLookup,
            serde_json::json!({ "targets": ["LIC-1001", "LIC-1002"] }),
        )
    }

    #[test]
    fn new_job_starts_queued_and_unlocked() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.lock_token.is_none());
        assert!(job.locked_at.is_none());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn queued_unlocked_past_run_at_is_claimable() {
        let job = sample_job();
        assert!(job.is_claimable(Utc::now()));
    }

    #[test]
    fn future_run_at_is_not_claimable() {
        let mut job = sample_job();
        job.run_at = Utc::now() + chrono::Duration::minutes(10);
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn locked_job_is_not_claimable() {
        let mut job = sample_job();
        job.lock_token = Some(Uuid::new_v4());
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn running_job_is_not_claimable() {
        let mut job = sample_job();
        job.status = JobStatus::Running;
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn target_count_reads_payload_targets() {
        let job = sample_job();
        assert_eq!(job.target_count(), Some(2));

        let empty = Job::immediate(JobType::CaseSync, serde_json::json!({}));
        assert_eq!(empty.target_count(), None);
    }

    #[test]
    fn job_type_tags_round_trip() {
        for job_type in [JobType::LicenseLookup, JobType::CaseSync] {
            assert_eq!(JobType::from_str(job_type.as_str()), Some(job_type));
        }
        assert_eq!(JobType::from_str("mystery_job"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
