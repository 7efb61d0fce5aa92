//! Case sync processor.
//!
//! Re-reads the portal-side state of open wage cases and refreshes the
//! local snapshot table. Same sub-target contract as the lookup processor:
//! per-target failures are counted, progress is bumped after every target.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::jobs::job::{CaseSyncPayload, Job, JobType};
use crate::jobs::store;
use crate::retry::{with_retry, RetryConfig};

use super::portal::{CaseRecord, PortalClient};
use super::{Processor, RunSummary};

pub struct CaseSyncProcessor {
    portal: Arc<PortalClient>,
    retry: RetryConfig,
}

impl CaseSyncProcessor {
    pub fn new(portal: Arc<PortalClient>, retry: RetryConfig) -> Self {
        Self { portal, retry }
    }

    async fn snapshot(&self, pool: &PgPool, record: &CaseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portal_case_snapshots (case_id, stage, last_activity_at, synced_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (case_id) DO UPDATE SET
                stage = EXCLUDED.stage,
                last_activity_at = EXCLUDED.last_activity_at,
                synced_at = NOW()
            "#,
        )
        .bind(record.case_id)
        .bind(&record.stage)
        .bind(record.last_activity_at)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Processor for CaseSyncProcessor {
    fn job_type(&self) -> JobType {
        JobType::CaseSync
    }

    async fn run(&self, pool: &PgPool, job: &Job) -> Result<RunSummary> {
        let payload: CaseSyncPayload =
            serde_json::from_value(job.payload.clone()).context("invalid case_sync payload")?;

        let mut summary = RunSummary::default();

        for (index, case_id) in payload.targets.iter().enumerate() {
            let outcome = with_retry(|| self.portal.fetch_case(*case_id), &self.retry).await;

            match outcome.result {
                Ok(record) => {
                    debug!(
                        job_id = %job.id,
                        case_id = %case_id,
                        stage = %record.stage,
                        "case sync succeeded"
                    );
                    self.snapshot(pool, &record).await?;
                    summary.succeeded += 1;
                    if record.stage == "closed" {
                        summary.count("closed_cases");
                    }
                }
                Err(error) => {
                    if matches!(error.status, Some(401) | Some(403)) {
                        bail!("portal rejected credentials: {}", error);
                    }
                    warn!(
                        job_id = %job.id,
                        case_id = %case_id,
                        attempts = outcome.attempts,
                        error = %error,
                        "case sync failed after retries"
                    );
                    summary.failed += 1;
                }
            }

            store::update_progress(pool, job.id, (index + 1) as i32).await?;
        }

        Ok(summary)
    }
}
