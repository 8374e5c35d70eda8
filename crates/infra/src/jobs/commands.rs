//! Commands operating on jobs.
//!
//! Every job state change goes through one of these, so it runs inside the
//! command pipeline: one transaction, a fresh entity cache, guarded writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use flowforge_core::{EngineError, EngineResult, EntityId};

use crate::command::context::{CommandContext, TransactionState};
use crate::command::Command;
use crate::db::entity_manager::FlushOutcome;

use super::incident::IncidentInfo;
use super::types::{JobInfo, JobInvocation, NewJob};

const STACKTRACE_NAME: &str = "job-exception-stacktrace";

/// Out-of-range durations saturate at roughly a century.
fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5_200))
}

/// Jobs locked by one acquisition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquiredJobs {
    pub job_ids: Vec<EntityId>,
    /// Candidates selected before locking; `selected - job_ids.len()` were
    /// taken by someone else in between.
    pub selected: usize,
}

/// Select due jobs and lock them for `lock_owner`.
///
/// Each lock is written immediately with a revision-guarded update; a job
/// whose update hits zero rows was locked by a competing node and is skipped
/// without failing the acquisition.
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub lock_owner: String,
    pub lock_duration: Duration,
    pub max_jobs: usize,
}

impl Command for AcquireJobsCmd {
    type Output = AcquiredJobs;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<AcquiredJobs> {
        let now = ctx.now();
        let lock_until = now + chrono_duration(self.lock_duration);
        let candidates = ctx.job_manager().find_acquirable(now, self.max_jobs)?;

        let mut acquired = AcquiredJobs {
            job_ids: Vec::with_capacity(candidates.len()),
            selected: candidates.len(),
        };
        for job in candidates {
            let id = job.borrow().job_id()?;
            job.borrow_mut().lock(&self.lock_owner, lock_until);
            match ctx.entity_manager().flush_entity(&job)? {
                FlushOutcome::Applied | FlushOutcome::Unchanged => acquired.job_ids.push(id),
                FlushOutcome::Conflict => {
                    debug!(job_id = %id, "job locked by another node, skipping");
                }
            }
        }
        Ok(acquired)
    }

    fn name(&self) -> &str {
        "AcquireJobs"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Succeeded,
    /// The job is gone or locked by someone else.
    Skipped,
}

/// Run the job's handler and delete the job on success.
///
/// A handler error fails the command, rolling back whatever the handler
/// wrote; failure bookkeeping happens in [`HandleFailedJobCmd`].
#[derive(Debug, Clone)]
pub struct ExecuteJobCmd {
    pub job_id: EntityId,
    /// When set, the job is only executed while locked by this owner.
    pub lock_owner: Option<String>,
}

impl Command for ExecuteJobCmd {
    type Output = ExecutionResult;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<ExecutionResult> {
        let Some(job) = ctx.job_manager().find_by_id(&self.job_id)? else {
            debug!(job_id = %self.job_id, "job no longer exists");
            return Ok(ExecutionResult::Skipped);
        };
        if let Some(owner) = &self.lock_owner {
            if !job.borrow().is_locked_by(owner) {
                debug!(job_id = %self.job_id, owner = %owner, "job lock lost");
                return Ok(ExecutionResult::Skipped);
            }
        }

        let invocation = JobInvocation::from_entity(&job.borrow())?;
        let handler = ctx
            .services()
            .job_handlers()
            .resolve(&invocation.handler_type)
            .cloned()
            .ok_or_else(|| EngineError::JobExecution {
                message: format!("no handler registered for job type {}", invocation.handler_type),
                details: format!("handler lookup failed for {}", invocation.handler_type),
            })?;

        handler(ctx, &invocation).map_err(|e| EngineError::JobExecution {
            message: e.to_string(),
            details: format!("{e:?}"),
        })?;

        ctx.job_manager().delete(&job)?;
        Ok(ExecutionResult::Succeeded)
    }

    fn name(&self) -> &str {
        "ExecuteJob"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled { due_date: DateTime<Utc> },
    /// Retries exhausted: incident created, job left locked.
    Exhausted,
    Skipped,
}

/// Record a failed attempt: store the error, consume one retry and either
/// reschedule with backoff or leave the job locked with an incident.
#[derive(Debug, Clone)]
pub struct HandleFailedJobCmd {
    pub job_id: EntityId,
    pub lock_owner: Option<String>,
    pub message: String,
    pub details: String,
}

impl Command for HandleFailedJobCmd {
    type Output = FailureOutcome;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<FailureOutcome> {
        let jobs = ctx.job_manager();
        let Some(job) = jobs.find_by_id(&self.job_id)? else {
            return Ok(FailureOutcome::Skipped);
        };
        if let Some(owner) = &self.lock_owner {
            if !job.borrow().is_locked_by(owner) {
                return Ok(FailureOutcome::Skipped);
            }
        }

        let (attempts, remaining) = {
            let mut job = job.borrow_mut();
            job.attempts += 1;
            job.exception_message = Some(self.message.clone());
            job.exception_stacktrace
                .set_bytes(STACKTRACE_NAME, self.details.clone().into_bytes())?;
            (job.attempts, job.retries - 1)
        };
        jobs.set_retries(&job, remaining)?;

        if remaining <= 0 {
            warn!(job_id = %self.job_id, attempts, error = %self.message, "job retries exhausted");
            return Ok(FailureOutcome::Exhausted);
        }

        let delay = ctx
            .services()
            .config()
            .job_executor
            .retry_backoff
            .delay_for_attempt(attempts);
        let due_date = ctx.now() + chrono_duration(delay);
        {
            let mut job = job.borrow_mut();
            job.unlock();
            job.due_date = Some(due_date);
        }
        info!(
            job_id = %self.job_id,
            attempts,
            retries = remaining,
            %due_date,
            error = %self.message,
            "job failed, rescheduled"
        );
        Ok(FailureOutcome::Rescheduled { due_date })
    }

    fn name(&self) -> &str {
        "HandleFailedJob"
    }
}

/// Release locks held by `lock_owner` without touching retries.
#[derive(Debug, Clone)]
pub struct UnlockJobsCmd {
    pub job_ids: Vec<EntityId>,
    pub lock_owner: String,
}

impl Command for UnlockJobsCmd {
    type Output = usize;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<usize> {
        let mut unlocked = 0;
        for id in &self.job_ids {
            if let Some(job) = ctx.job_manager().find_by_id(id)? {
                let mut job = job.borrow_mut();
                if job.is_locked_by(&self.lock_owner) {
                    job.unlock();
                    unlocked += 1;
                }
            }
        }
        if unlocked > 0 {
            notify_on_commit(ctx);
        }
        Ok(unlocked)
    }

    fn name(&self) -> &str {
        "UnlockJobs"
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleJobCmd(pub NewJob);

impl Command for ScheduleJobCmd {
    type Output = JobInfo;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<JobInfo> {
        let job = ctx.job_manager().schedule(self.0.clone())?;
        JobInfo::from_entity(&job.borrow())
    }

    fn name(&self) -> &str {
        "ScheduleJob"
    }
}

#[derive(Debug, Clone)]
pub struct GetJobCmd(pub EntityId);

impl Command for GetJobCmd {
    type Output = Option<JobInfo>;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<Option<JobInfo>> {
        ctx.job_manager()
            .find_by_id(&self.0)?
            .map(|job| JobInfo::from_entity(&job.borrow()))
            .transpose()
    }

    fn name(&self) -> &str {
        "GetJob"
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListJobsCmd;

impl Command for ListJobsCmd {
    type Output = Vec<JobInfo>;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<Vec<JobInfo>> {
        ctx.job_manager()
            .find_all()?
            .iter()
            .map(|job| JobInfo::from_entity(&job.borrow()))
            .collect()
    }

    fn name(&self) -> &str {
        "ListJobs"
    }
}

/// Set a job's retries. Raising them also releases the lock so an exhausted
/// job becomes acquirable again.
#[derive(Debug, Clone)]
pub struct SetJobRetriesCmd {
    pub job_id: EntityId,
    pub retries: i32,
}

impl Command for SetJobRetriesCmd {
    type Output = ();

    fn execute(&self, ctx: &CommandContext) -> EngineResult<()> {
        if self.retries < 0 {
            return Err(EngineError::invalid_argument(format!(
                "retries must not be negative, got {}",
                self.retries
            )));
        }
        let job = ctx
            .job_manager()
            .find_by_id(&self.job_id)?
            .ok_or_else(|| EngineError::not_found(format!("job {}", self.job_id)))?;
        ctx.job_manager().set_retries(&job, self.retries)?;
        if self.retries > 0 {
            job.borrow_mut().unlock();
            notify_on_commit(ctx);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "SetJobRetries"
    }
}

#[derive(Debug, Clone)]
pub struct DeleteJobCmd(pub EntityId);

impl Command for DeleteJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<bool> {
        match ctx.job_manager().find_by_id(&self.0)? {
            Some(job) => {
                ctx.job_manager().delete(&job)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "DeleteJob"
    }
}

#[derive(Debug, Clone)]
pub struct SuspendJobCmd {
    pub job_id: EntityId,
    pub suspended: bool,
}

impl Command for SuspendJobCmd {
    type Output = ();

    fn execute(&self, ctx: &CommandContext) -> EngineResult<()> {
        let job = ctx
            .job_manager()
            .find_by_id(&self.job_id)?
            .ok_or_else(|| EngineError::not_found(format!("job {}", self.job_id)))?;
        job.borrow_mut().suspended = self.suspended;
        if !self.suspended {
            notify_on_commit(ctx);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "SuspendJob"
    }
}

#[derive(Debug, Clone)]
pub struct SetJobPriorityCmd {
    pub job_id: EntityId,
    pub priority: i64,
}

impl Command for SetJobPriorityCmd {
    type Output = ();

    fn execute(&self, ctx: &CommandContext) -> EngineResult<()> {
        let job = ctx
            .job_manager()
            .find_by_id(&self.job_id)?
            .ok_or_else(|| EngineError::not_found(format!("job {}", self.job_id)))?;
        job.borrow_mut().priority = self.priority;
        Ok(())
    }

    fn name(&self) -> &str {
        "SetJobPriority"
    }
}

/// Move a job's due date; `None` makes it due immediately. The lock and
/// retries are left alone.
#[derive(Debug, Clone)]
pub struct SetJobDuedateCmd {
    pub job_id: EntityId,
    pub due_date: Option<DateTime<Utc>>,
}

impl Command for SetJobDuedateCmd {
    type Output = ();

    fn execute(&self, ctx: &CommandContext) -> EngineResult<()> {
        let job = ctx
            .job_manager()
            .find_by_id(&self.job_id)?
            .ok_or_else(|| EngineError::not_found(format!("job {}", self.job_id)))?;
        let due = {
            let mut job = job.borrow_mut();
            job.due_date = self.due_date;
            job.is_due(ctx.now())
        };
        if due {
            notify_on_commit(ctx);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "SetJobDuedate"
    }
}

#[derive(Debug, Clone)]
pub struct GetJobExceptionStacktraceCmd(pub EntityId);

impl Command for GetJobExceptionStacktraceCmd {
    type Output = Option<String>;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<Option<String>> {
        let job = ctx
            .job_manager()
            .find_by_id(&self.0)?
            .ok_or_else(|| EngineError::not_found(format!("job {}", self.0)))?;
        let bytes = job.borrow().exception_stacktrace.get_bytes()?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    fn name(&self) -> &str {
        "GetJobExceptionStacktrace"
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListIncidentsCmd;

impl Command for ListIncidentsCmd {
    type Output = Vec<IncidentInfo>;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<Vec<IncidentInfo>> {
        ctx.incident_manager().list()
    }

    fn name(&self) -> &str {
        "ListIncidents"
    }
}

fn notify_on_commit(ctx: &CommandContext) {
    let services = ctx.services().clone();
    ctx.add_transaction_listener(TransactionState::Committed, move || {
        services.acquisition_signal().notify()
    });
}
