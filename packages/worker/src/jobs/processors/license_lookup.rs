//! License lookup processor.
//!
//! Walks the payload's license numbers, looks each one up on the agency
//! portal with operation-level retry, snapshots the result, and bumps job
//! progress after every target. A target that still fails after retries is
//! counted and skipped; only credential rejections abort the whole job.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::jobs::job::{Job, JobType, LookupPayload};
use crate::jobs::store;
use crate::retry::{with_retry, RetryConfig};

use super::portal::{LicenseRecord, PortalClient};
use super::{Processor, RunSummary};

pub struct LicenseLookupProcessor {
    portal: Arc<PortalClient>,
    retry: RetryConfig,
}

impl LicenseLookupProcessor {
    pub fn new(portal: Arc<PortalClient>, retry: RetryConfig) -> Self {
        Self { portal, retry }
    }

    async fn snapshot(&self, pool: &PgPool, record: &LicenseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO license_snapshots (license_number, status, employer_name, expires_at, checked_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (license_number) DO UPDATE SET
                status = EXCLUDED.status,
                employer_name = EXCLUDED.employer_name,
                expires_at = EXCLUDED.expires_at,
                checked_at = NOW()
            "#,
        )
        .bind(&record.license_number)
        .bind(&record.status)
        .bind(&record.employer_name)
        .bind(record.expires_at)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Processor for LicenseLookupProcessor {
    fn job_type(&self) -> JobType {
        JobType::LicenseLookup
    }

    async fn run(&self, pool: &PgPool, job: &Job) -> Result<RunSummary> {
        let payload: LookupPayload = serde_json::from_value(job.payload.clone())
            .context("invalid license_lookup payload")?;

        let mut summary = RunSummary::default();

        for (index, license_number) in payload.targets.iter().enumerate() {
            let outcome = with_retry(|| self.portal.fetch_license(license_number), &self.retry).await;

            match outcome.result {
                Ok(record) => {
                    debug!(
                        job_id = %job.id,
                        license_number = %license_number,
                        status = %record.status,
                        attempts = outcome.attempts,
                        "license lookup succeeded"
                    );
                    self.snapshot(pool, &record).await?;
                    summary.succeeded += 1;
                    if record.status == "active" {
                        summary.count("active_licenses");
                    } else {
                        summary.count("lapsed_licenses");
                    }
                }
                Err(error) => {
                    if matches!(error.status, Some(401) | Some(403)) {
                        bail!("portal rejected credentials: {}", error);
                    }
                    warn!(
                        job_id = %job.id,
                        license_number = %license_number,
                        attempts = outcome.attempts,
                        error = %error,
                        "license lookup failed after retries"
                    );
                    summary.failed += 1;
                }
            }

            store::update_progress(pool, job.id, (index + 1) as i32).await?;
        }

        Ok(summary)
    }
}
