//! Asynchronous jobs: persistence, handlers, acquisition and execution.
//!
//! ## Lifecycle
//!
//! ```text
//! scheduled ──► acquirable ──► locked ──► executed ──► deleted
//!                   ▲                        │ failure
//!                   │   retries left         ▼
//!                   └──────────────── retries - 1, unlocked, due = now + backoff
//!                                            │ retries == 0
//!                                            ▼
//!                                     incident, job stays locked
//! ```
//!
//! ## Components
//!
//! - `JobEntity`: the persisted job, with its deferred exception stacktrace
//! - `JobManager` / `IncidentManager`: context-bound persistence helpers
//! - `JobHandlerRegistry`: handler lookup by job type
//! - `commands`: every job state change as a pipeline command
//! - `JobExecutor`: acquisition thread and worker pool

pub mod commands;
pub mod executor;
pub mod handler;
pub mod incident;
pub mod manager;
pub mod types;

pub use commands::{AcquiredJobs, ExecutionResult, FailureOutcome};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorHandle, JobRunOutcome};
pub use handler::{JobHandler, JobHandlerRegistry};
pub use incident::{IncidentEntity, IncidentInfo, IncidentManager, FAILED_JOB_INCIDENT};
pub use manager::JobManager;
pub use types::{BackoffPolicy, BackoffStrategy, JobEntity, JobInfo, JobInvocation, NewJob};
