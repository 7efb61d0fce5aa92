//! The worker loop.
//!
//! One logical loop per process: sweep stale locks on a throttled cadence,
//! claim the next eligible job, dispatch it to the processor matching its
//! type, record lifecycle events, and write the terminal status. Job
//! dispatch is sequential within a process; concurrency comes from running
//! multiple worker processes against the same database.
//!
//! ```text
//! Dispatcher
//!     │
//!     ├─► cleanup_stale_locks (throttled)
//!     ├─► reserve_next_job ──(none)──► poll sleep
//!     ├─► job_started event, progress init
//!     ├─► Processor::run ──► job_completed / job_failed (+ requeue)
//!     └─► release_job_lock (always)
//! ```

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::WorkerState;

use super::events::{self, JobEvent, RequeueReason};
use super::job::Job;
use super::lease::LeaseManager;
use super::processors::ProcessorMap;
use super::store;

/// Timing knobs for the loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between polls when no job is eligible. Also the fixed delay
    /// before a job-level retry.
    pub poll_interval: Duration,
    /// Grace period an in-flight job gets after a shutdown signal.
    pub shutdown_timeout: Duration,
    /// Minimum spacing between stale-lock sweeps.
    pub stale_sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            shutdown_timeout: Duration::from_millis(300_000),
            stale_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    pub fn from_app_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }
}

pub struct Dispatcher {
    pool: PgPool,
    lease: LeaseManager,
    processors: ProcessorMap,
    config: DispatcherConfig,
    state: Arc<WorkerState>,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        lease: LeaseManager,
        processors: ProcessorMap,
        config: DispatcherConfig,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            pool,
            lease,
            processors,
            config,
            state,
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Store errors inside the loop are logged and followed by a poll
    /// sleep; the process does not terminate on isolated store hiccups.
    pub async fn run(self) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            shutdown_timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            "job dispatcher starting"
        );

        let mut last_sweep: Option<Instant> = None;
        while !self.state.is_shutting_down() {
            let sweep_due = last_sweep
                .map(|at| at.elapsed() >= self.config.stale_sweep_interval)
                .unwrap_or(true);
            if sweep_due {
                last_sweep = Some(Instant::now());
                match self.lease.cleanup_stale_locks().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "recovered jobs with stale locks"),
                    Err(e) => error!(error = %e, "stale lock sweep failed"),
                }
            }

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => self.idle_sleep().await,
                Err(e) => {
                    error!(error = %e, "dispatch cycle failed");
                    self.idle_sleep().await;
                }
            }
        }

        info!("job dispatcher stopped");
        Ok(())
    }

    /// Claim and dispatch at most one job. Returns whether a job was
    /// processed. An empty queue and a lost lease race look the same here.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.lease.reserve_next_job().await? else {
            return Ok(false);
        };
        self.dispatch_with_grace(job).await;
        Ok(true)
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.state.shutdown_requested() => {}
        }
    }

    /// Dispatch one job, bounding it by the shutdown grace period once a
    /// termination signal arrives. The lock release at the end runs on
    /// every path.
    async fn dispatch_with_grace(&self, job: Job) {
        let job_id = job.id;
        self.state.set_current_job(Some(job_id)).await;

        {
            let dispatch = self.dispatch(&job);
            tokio::pin!(dispatch);

            let interrupted = tokio::select! {
                _ = &mut dispatch => false,
                _ = self.state.shutdown_requested() => {
                    info!(
                        job_id = %job_id,
                        grace_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "shutdown requested, waiting for in-flight job"
                    );
                    tokio::time::timeout(self.config.shutdown_timeout, &mut dispatch)
                        .await
                        .is_err()
                }
            };

            if interrupted {
                warn!(job_id = %job_id, "job exceeded shutdown grace period, requeueing");
                match store::requeue_interrupted(&self.pool, job_id).await {
                    Ok(true) => {
                        events::record(
                            &self.pool,
                            job_id,
                            &JobEvent::Requeued {
                                reason: RequeueReason::Shutdown,
                                attempts: job.attempts,
                            },
                        )
                        .await;
                    }
                    // Already reached a terminal status; nothing to undo.
                    Ok(false) => {}
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to requeue interrupted job")
                    }
                }
            }
        }

        if let Err(e) = self.lease.release_job_lock(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to release job lock");
        }
        self.state.set_current_job(None).await;
    }

    async fn dispatch(&self, job: &Job) {
        let attempt = job.attempts + 1;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt,
            max_attempts = job.max_attempts,
            "dispatching job"
        );
        events::record(&self.pool, job.id, &JobEvent::Started { attempt }).await;

        if let Some(total) = job.target_count() {
            if let Err(e) = store::init_progress(&self.pool, job.id, total as i32).await {
                error!(job_id = %job.id, error = %e, "failed to initialize job progress");
            }
        }

        let processor = match job.parsed_type().and_then(|t| self.processors.get(&t)) {
            Some(processor) => processor,
            None => {
                self.skip_unknown(job, attempt).await;
                return;
            }
        };

        let started = Instant::now();
        match processor.run(&self.pool, job).await {
            Ok(summary) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                events::record(&self.pool, job.id, &JobEvent::Completed { summary }).await;
                if let Err(e) = store::mark_succeeded(&self.pool, job.id, attempt).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job as succeeded");
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt,
                    error = %message,
                    "job failed"
                );
                events::record(
                    &self.pool,
                    job.id,
                    &JobEvent::Failed {
                        error: message.clone(),
                        attempt,
                    },
                )
                .await;
                self.handle_failure(job, attempt, &message).await;
            }
        }
    }

    /// Unknown job type: a configuration/data error, failed immediately and
    /// never retried.
    async fn skip_unknown(&self, job: &Job, attempt: i32) {
        let message = format!("no processor registered for job type: {}", job.job_type);
        warn!(job_id = %job.id, job_type = %job.job_type, "skipping job with unknown type");
        events::record(
            &self.pool,
            job.id,
            &JobEvent::Skipped {
                job_type: job.job_type.clone(),
            },
        )
        .await;
        if let Err(e) = store::mark_failed(&self.pool, job.id, attempt, &message).await {
            error!(job_id = %job.id, error = %e, "failed to mark skipped job as failed");
        }
    }

    /// Requeue-or-fail decision after a processor error.
    ///
    /// The fixed `poll_interval` requeue delay is the outer job-level
    /// retry; exponential backoff belongs to the operation-level retry
    /// inside processors.
    async fn handle_failure(&self, job: &Job, attempt: i32, message: &str) {
        if attempt < job.max_attempts {
            let run_at = Utc::now()
                + chrono::Duration::milliseconds(self.config.poll_interval.as_millis() as i64);
            if let Err(e) =
                store::requeue_for_retry(&self.pool, job.id, attempt, message, run_at).await
            {
                error!(job_id = %job.id, error = %e, "failed to requeue job for retry");
                return;
            }
            events::record(
                &self.pool,
                job.id,
                &JobEvent::Requeued {
                    reason: RequeueReason::Retry,
                    attempts: attempt,
                },
            )
            .await;
        } else if let Err(e) = store::mark_failed(&self.pool, job.id, attempt, message).await {
            error!(job_id = %job.id, error = %e, "failed to mark job as failed");
        }
    }
}
