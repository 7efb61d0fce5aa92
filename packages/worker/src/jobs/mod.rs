//! Background job subsystem.
//!
//! - [`job`] - the job row model and payload shapes
//! - [`events`] - append-only lifecycle audit log
//! - [`lease`] - atomic claiming, release, and stale-lock recovery
//! - [`store`] - status and progress writes owned by the dispatcher
//! - [`processors`] - per-job-type domain operations
//! - [`dispatcher`] - the worker loop

pub mod dispatcher;
pub mod events;
pub mod job;
pub mod lease;
pub mod processors;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use events::JobEvent;
pub use job::{Job, JobStatus, JobType};
pub use lease::LeaseManager;
pub use processors::{Processor, ProcessorMap, RunSummary};
