//! Per-job-type domain operations.
//!
//! Processors are long external operations (agency-portal lookups) invoked
//! by the dispatcher. They may return errors; the dispatcher catches them
//! and drives the requeue-or-fail decision. Processors report progress
//! incrementally through [`crate::jobs::store::update_progress`] as they
//! work through sub-targets.

mod case_sync;
mod license_lookup;
mod portal;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::retry::RetryConfig;

use super::job::{Job, JobType};

pub use case_sync::CaseSyncProcessor;
pub use license_lookup::LicenseLookupProcessor;
pub use portal::{CaseRecord, LicenseRecord, PortalClient};

/// Outcome summary reported by a processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Sub-targets processed successfully.
    pub succeeded: u32,
    /// Sub-targets that failed after operation-level retries.
    pub failed: u32,
    /// Type-specific counters (e.g. active licenses seen).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub counters: serde_json::Map<String, serde_json::Value>,
}

impl RunSummary {
    /// Bump a named type-specific counter.
    pub fn count(&mut self, key: &str) {
        let entry = self
            .counters
            .entry(key.to_string())
            .or_insert(serde_json::Value::from(0u64));
        if let Some(n) = entry.as_u64() {
            *entry = serde_json::Value::from(n + 1);
        }
    }
}

/// A domain operation the dispatcher can invoke for a claimed job.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Execute the job. Errors are caught by the dispatcher and count as a
    /// whole-job attempt.
    async fn run(&self, pool: &PgPool, job: &Job) -> anyhow::Result<RunSummary>;
}

pub type ProcessorMap = HashMap<JobType, Arc<dyn Processor>>;

/// Build the production processor registry.
pub fn registry(portal: Arc<PortalClient>, retry: RetryConfig) -> ProcessorMap {
    let processors: Vec<Arc<dyn Processor>> = vec![
        Arc::new(LicenseLookupProcessor::new(portal.clone(), retry.clone())),
        Arc::new(CaseSyncProcessor::new(portal, retry)),
    ];

    processors
        .into_iter()
        .map(|processor| (processor.job_type(), processor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_accumulates_named_counters() {
        let mut summary = RunSummary::default();
        summary.count("active_licenses");
        summary.count("active_licenses");
        summary.count("lapsed_licenses");

        assert_eq!(summary.counters["active_licenses"], 2);
        assert_eq!(summary.counters["lapsed_licenses"], 1);
    }

    #[test]
    fn empty_counters_are_omitted_from_event_payloads() {
        let summary = RunSummary {
            succeeded: 3,
            failed: 0,
            counters: serde_json::Map::new(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("counters").is_none());
    }
}
