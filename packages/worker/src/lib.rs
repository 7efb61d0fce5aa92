//! Background job worker for the Fair Day case-management system.
//!
//! The worker is a long-running process that polls a shared Postgres job
//! table, leases jobs under mutual exclusion, dispatches them to the matching
//! processor (agency-portal license lookups, case syncs), and shuts down
//! gracefully without losing in-flight work.
//!
//! # Architecture
//!
//! ```text
//! Config ─► db (shared PgPool)
//!               │
//!               ├─► LeaseManager (claim / release / stale-lock sweep)
//!               ├─► Dispatcher loop ─► Processor (by job type)
//!               │        └─► job_events (append-only audit log)
//!               └─► health (GET /health, shutdown state)
//! ```
//!
//! Multiple worker processes may run against the same database; all
//! cross-process coordination goes through the lease fields on the job row
//! using atomic conditional updates.

pub mod config;
pub mod db;
pub mod health;
pub mod jobs;
pub mod retry;

pub use config::Config;
