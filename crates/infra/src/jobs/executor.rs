//! Job executor: acquisition thread plus a bounded worker pool.
//!
//! ```text
//!  acquisition thread                      worker threads (worker_threads)
//!  ──────────────────                      ───────────────────────────────
//!  AcquireJobsCmd (lock batch)             recv job id
//!        │                                     │
//!        ▼          sync_channel               ▼
//!  try_send ids ──► (queue_capacity) ──►  ExecuteJobCmd
//!        │ full                                │ handler error
//!        ▼                                     ▼
//!  UnlockJobsCmd (rejected)               HandleFailedJobCmd
//!        │                                (retries-1, backoff | incident)
//!        ▼
//!  wait (full batch / partial / idle growth), woken early by due jobs
//! ```
//!
//! Nodes coordinate only through the store: a job is executed by whoever
//! holds its lock, and a lost lock race is skipped, never retried here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use flowforge_core::{EngineError, EngineResult, EntityId};

use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;

use super::commands::{
    AcquireJobsCmd, AcquiredJobs, ExecuteJobCmd, ExecutionResult, FailureOutcome,
    HandleFailedJobCmd, UnlockJobsCmd,
};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub incidents_created: u64,
    /// Jobs lost to another node, at acquisition or execution time.
    pub conflicts: u64,
    /// Acquired jobs handed back because the execution queue was full.
    pub rejected: u64,
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one acquired job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunOutcome {
    Succeeded,
    /// Gone, or no longer locked by this executor.
    Skipped,
    /// Lost to a competing transaction; unlocked without consuming a retry.
    Conflict,
    Rescheduled,
    /// Out of retries; an incident was created.
    Exhausted,
    /// The failure itself could not be recorded. The lock expires eventually.
    Failed(String),
}

pub struct JobExecutor {
    commands: Arc<CommandExecutor>,
    config: JobExecutorConfig,
    failed_job_command_retries: u32,
    stats: Mutex<ExecutorStats>,
    started: Instant,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("name", &self.config.name)
            .field("lock_owner", &self.config.lock_owner)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub(crate) fn new(commands: Arc<CommandExecutor>) -> Self {
        let engine_config = commands.services().config();
        let config = engine_config.job_executor.clone();
        let failed_job_command_retries = engine_config.failed_job_command_retries;
        Self {
            commands,
            config,
            failed_job_command_retries,
            stats: Mutex::new(ExecutorStats::default()),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    pub fn lock_owner(&self) -> &str {
        &self.config.lock_owner
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats_guard().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Acquire and lock one batch of due jobs.
    pub fn run_acquisition_cycle(&self) -> EngineResult<AcquiredJobs> {
        let acquired = self.commands.execute(AcquireJobsCmd {
            lock_owner: self.config.lock_owner.clone(),
            lock_duration: self.config.lock_duration,
            max_jobs: self.config.max_jobs_per_acquisition,
        })?;

        let mut stats = self.stats_guard();
        stats.acquisition_cycles += 1;
        stats.jobs_acquired += acquired.job_ids.len() as u64;
        stats.conflicts += acquired.selected.saturating_sub(acquired.job_ids.len()) as u64;
        drop(stats);

        if !acquired.job_ids.is_empty() {
            debug!(
                executor = %self.config.name,
                acquired = acquired.job_ids.len(),
                selected = acquired.selected,
                "jobs acquired"
            );
        }
        Ok(acquired)
    }

    /// Execute acquired jobs one after another on the calling thread.
    pub fn execute_acquired(&self, acquired: &AcquiredJobs) -> Vec<(EntityId, JobRunOutcome)> {
        acquired
            .job_ids
            .iter()
            .map(|id| (id.clone(), self.execute_job(id)))
            .collect()
    }

    /// Execute one job locked by this executor. Never fails: every outcome,
    /// including failure bookkeeping errors, is reported as a [`JobRunOutcome`].
    pub fn execute_job(&self, job_id: &EntityId) -> JobRunOutcome {
        self.stats_guard().current_running += 1;

        let outcome = match self.commands.execute(ExecuteJobCmd {
            job_id: job_id.clone(),
            lock_owner: Some(self.config.lock_owner.clone()),
        }) {
            Ok(ExecutionResult::Succeeded) => {
                debug!(job_id = %job_id, "job completed successfully");
                JobRunOutcome::Succeeded
            }
            Ok(ExecutionResult::Skipped) => JobRunOutcome::Skipped,
            // A lost race hands the job back untouched; any other failure,
            // fatal commits included, consumes a retry.
            Err(e) if e.is_conflict() => {
                debug!(job_id = %job_id, error = %e, "job execution conflicted, unlocking");
                self.unlock(vec![job_id.clone()]);
                JobRunOutcome::Conflict
            }
            Err(e) => self.handle_failure(job_id, &e),
        };

        let mut stats = self.stats_guard();
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.jobs_processed += 1;
        match &outcome {
            JobRunOutcome::Succeeded => stats.jobs_succeeded += 1,
            JobRunOutcome::Conflict => stats.conflicts += 1,
            JobRunOutcome::Rescheduled | JobRunOutcome::Failed(_) => stats.jobs_failed += 1,
            JobRunOutcome::Exhausted => {
                stats.jobs_failed += 1;
                stats.incidents_created += 1;
            }
            JobRunOutcome::Skipped => {}
        }
        outcome
    }

    fn handle_failure(&self, job_id: &EntityId, failure: &EngineError) -> JobRunOutcome {
        let command = HandleFailedJobCmd {
            job_id: job_id.clone(),
            lock_owner: Some(self.config.lock_owner.clone()),
            message: failure.message(),
            details: failure.details(),
        };

        let mut attempt = 0;
        loop {
            match self.commands.execute(command.clone()) {
                Ok(FailureOutcome::Rescheduled { .. }) => return JobRunOutcome::Rescheduled,
                Ok(FailureOutcome::Exhausted) => return JobRunOutcome::Exhausted,
                Ok(FailureOutcome::Skipped) => return JobRunOutcome::Skipped,
                Err(e) if e.is_optimistic_locking() && attempt < self.failed_job_command_retries => {
                    attempt += 1;
                    debug!(job_id = %job_id, attempt, "retrying failed job handling");
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "could not record job failure");
                    return JobRunOutcome::Failed(e.to_string());
                }
            }
        }
    }

    fn unlock(&self, job_ids: Vec<EntityId>) {
        if job_ids.is_empty() {
            return;
        }
        let count = job_ids.len();
        if let Err(e) = self.commands.execute(UnlockJobsCmd {
            job_ids,
            lock_owner: self.config.lock_owner.clone(),
        }) {
            warn!(count, error = %e, "failed to unlock jobs; locks will expire");
        }
    }

    fn stats_guard(&self) -> std::sync::MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the acquisition thread and the worker pool.
    pub fn spawn(self: Arc<Self>) -> EngineResult<JobExecutorHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let unstarted = Arc::new(Mutex::new(Vec::new()));
        let (queue, receiver) = mpsc::sync_channel::<EntityId>(self.config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let name = self.config.name.clone();

        let mut workers = Vec::with_capacity(self.config.worker_threads);
        for index in 0..self.config.worker_threads {
            let executor = self.clone();
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            let unstarted = unstarted.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&executor, &receiver, &shutdown, &unstarted))
                .map_err(|e| EngineError::command(format!("failed to spawn job worker: {e}")))?;
            workers.push(worker);
        }

        let acquisition = {
            let executor = self.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("{name}-acquisition"))
                .spawn(move || acquisition_loop(&executor, queue, &shutdown))
                .map_err(|e| {
                    EngineError::command(format!("failed to spawn job acquisition thread: {e}"))
                })?
        };

        info!(
            executor = %name,
            lock_owner = %self.config.lock_owner,
            workers = workers.len(),
            queue_capacity = self.config.queue_capacity,
            "job executor started"
        );

        Ok(JobExecutorHandle {
            executor: self,
            shutdown,
            acquisition: Some(acquisition),
            workers,
            unstarted,
        })
    }
}

fn acquisition_loop(executor: &JobExecutor, queue: SyncSender<EntityId>, shutdown: &AtomicBool) {
    let config = executor.config();
    let signal = executor.commands.services().acquisition_signal();
    let mut idle_cycles = 0u32;

    while !shutdown.load(Ordering::Acquire) {
        let wait = match executor.run_acquisition_cycle() {
            Ok(acquired) => {
                let count = acquired.job_ids.len();
                let mut rejected = Vec::new();
                for id in acquired.job_ids {
                    match queue.try_send(id) {
                        Ok(()) => {}
                        Err(TrySendError::Full(id)) | Err(TrySendError::Disconnected(id)) => {
                            rejected.push(id)
                        }
                    }
                }
                if !rejected.is_empty() {
                    warn!(
                        executor = %config.name,
                        rejected = rejected.len(),
                        "execution queue full, releasing jobs"
                    );
                    executor.stats_guard().rejected += rejected.len() as u64;
                    executor.unlock(rejected);
                }

                if count == 0 {
                    let wait = config.acquisition_wait(0, idle_cycles);
                    idle_cycles = idle_cycles.saturating_add(1);
                    wait
                } else {
                    idle_cycles = 0;
                    config.acquisition_wait(count, 0)
                }
            }
            Err(e) => {
                warn!(executor = %config.name, error = %e, "job acquisition failed");
                config.wait_time
            }
        };

        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !wait.is_zero() && signal.wait_timeout(wait) {
            idle_cycles = 0;
        }
    }
    debug!(executor = %config.name, "acquisition thread stopped");
}

fn worker_loop(
    executor: &JobExecutor,
    receiver: &Mutex<Receiver<EntityId>>,
    shutdown: &AtomicBool,
    unstarted: &Mutex<Vec<EntityId>>,
) {
    loop {
        let next = receiver.lock().unwrap_or_else(|e| e.into_inner()).recv();
        let Ok(job_id) = next else {
            break;
        };
        if shutdown.load(Ordering::Acquire) {
            unstarted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(job_id);
            continue;
        }
        executor.execute_job(&job_id);
    }
}

/// Handle to a running executor. Dropping it shuts the executor down.
pub struct JobExecutorHandle {
    executor: Arc<JobExecutor>,
    shutdown: Arc<AtomicBool>,
    acquisition: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    unstarted: Arc<Mutex<Vec<EntityId>>>,
}

impl std::fmt::Debug for JobExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutorHandle")
            .field("executor", &self.executor)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl JobExecutorHandle {
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    /// Graceful shutdown: stop acquiring, hand back queued jobs, wait up to
    /// `shutdown_timeout` for running commands, then join or abandon workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(acquisition) = self.acquisition.take() else {
            return;
        };
        let config = self.executor.config().clone();
        let services = self.executor.commands.services().clone();

        self.shutdown.store(true, Ordering::Release);
        services.acquisition_signal().notify();
        if acquisition.join().is_err() {
            error!(executor = %config.name, "acquisition thread panicked");
        }

        let workers = std::mem::take(&mut self.workers);
        if services.in_flight().wait_for_drain(config.shutdown_timeout) {
            for worker in workers {
                if worker.join().is_err() {
                    error!(executor = %config.name, "job worker panicked");
                }
            }
        } else {
            warn!(
                executor = %config.name,
                timeout_ms = config.shutdown_timeout.as_millis() as u64,
                "running jobs did not finish in time, abandoning workers"
            );
        }

        let unstarted = std::mem::take(&mut *self.unstarted.lock().unwrap_or_else(|e| e.into_inner()));
        if !unstarted.is_empty() {
            info!(executor = %config.name, count = unstarted.len(), "releasing queued jobs");
            self.executor.unlock(unstarted);
        }
        info!(executor = %config.name, "job executor stopped");
    }
}

impl Drop for JobExecutorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
