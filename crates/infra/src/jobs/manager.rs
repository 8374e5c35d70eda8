use std::cell::RefCell;
use std::cmp::Reverse;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use tracing::debug;

use flowforge_core::{EngineResult, EntityId};

use crate::command::context::{CommandContext, TransactionState};
use crate::persistence::AcquirableJobsQuery;

use super::types::{JobEntity, NewJob};

/// Job persistence operations bound to one command context.
pub struct JobManager<'a> {
    ctx: &'a CommandContext,
}

impl<'a> JobManager<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    /// Create a job. A job that is already due wakes the acquisition thread
    /// once the transaction commits.
    pub fn schedule(&self, job: NewJob) -> EngineResult<Rc<RefCell<JobEntity>>> {
        let now = self.ctx.now();
        let default_retries = self.ctx.services().config().default_job_retries;
        let job = self
            .ctx
            .entity_manager()
            .insert(JobEntity::new(job, default_retries, now))?;

        let (id, due) = {
            let job = job.borrow();
            (job.job_id()?, job.is_due(now))
        };
        debug!(job_id = %id, handler_type = %job.borrow().handler_type, due, "job scheduled");

        if due {
            let services = self.ctx.services().clone();
            self.ctx
                .add_transaction_listener(TransactionState::Committed, move || {
                    services.acquisition_signal().notify()
                });
        }
        Ok(job)
    }

    pub fn find_by_id(&self, id: &EntityId) -> EngineResult<Option<Rc<RefCell<JobEntity>>>> {
        self.ctx.entity_manager().select_by_id(id)
    }

    /// Every job, oldest first.
    pub fn find_all(&self) -> EngineResult<Vec<Rc<RefCell<JobEntity>>>> {
        let mut jobs = self.ctx.entity_manager().select_all::<JobEntity>()?;
        jobs.sort_by_cached_key(|job| {
            let job = job.borrow();
            (job.created_at, job.job_id().ok())
        });
        Ok(jobs)
    }

    /// Up to `limit` jobs acquirable at `now`: highest priority first, then
    /// due date ascending with undated jobs first.
    pub fn find_acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<Rc<RefCell<JobEntity>>>> {
        let query = AcquirableJobsQuery { now, limit };
        let mut jobs = self.ctx.entity_manager().select_with(
            |tx| tx.select_acquirable_jobs(&query),
            |job: &JobEntity| job.is_acquirable(now),
        )?;
        jobs.sort_by_cached_key(|job| {
            let job = job.borrow();
            (Reverse(job.priority), job.due_date, job.job_id().ok())
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Delete a job with its stacktrace and incidents.
    pub fn delete(&self, job: &Rc<RefCell<JobEntity>>) -> EngineResult<()> {
        let id = job.borrow().job_id()?;
        job.borrow_mut().exception_stacktrace.delete()?;
        self.ctx.incident_manager().resolve_for_job(&id)?;
        self.ctx.entity_manager().delete(job)
    }

    /// Set the retry counter (clamped at 0).
    ///
    /// Dropping to 0 opens a failed-job incident; raising from 0 resolves the
    /// job's incidents.
    pub fn set_retries(&self, job: &Rc<RefCell<JobEntity>>, retries: i32) -> EngineResult<()> {
        let retries = retries.max(0);
        let (id, previous, message) = {
            let mut job = job.borrow_mut();
            let previous = std::mem::replace(&mut job.retries, retries);
            (job.job_id()?, previous, job.exception_message.clone())
        };

        if previous > 0 && retries == 0 {
            self.ctx
                .incident_manager()
                .create_failed_job_incident(&id, message)?;
        } else if previous == 0 && retries > 0 {
            self.ctx.incident_manager().resolve_for_job(&id)?;
        }
        Ok(())
    }
}
