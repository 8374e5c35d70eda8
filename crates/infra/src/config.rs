//! Engine configuration loading and representation.
//!
//! Every knob has a default; [`EngineConfig::from_env`] overrides them from
//! `FLOWFORGE_*` environment variables. Durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::BackoffPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutorConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Identity written into `lock_owner` of acquired jobs; unique per instance
    pub lock_owner: String,
    /// Maximum jobs locked per acquisition cycle
    pub max_jobs_per_acquisition: usize,
    /// Wait after a cycle that found some, but fewer than the maximum, jobs
    pub wait_time: Duration,
    /// Upper bound for the idle wait
    pub max_wait: Duration,
    /// Growth of the idle wait per consecutive empty cycle
    pub wait_increase_factor: f64,
    /// Wait after a cycle that hit `max_jobs_per_acquisition`
    pub wait_after_full_batch: Duration,
    /// How long an acquired job stays locked
    pub lock_duration: Duration,
    /// Worker threads executing jobs
    pub worker_threads: usize,
    /// Acquired jobs waiting for a worker; more are unlocked and left to others
    pub queue_capacity: usize,
    /// Bounded wait for in-flight commands during shutdown
    pub shutdown_timeout: Duration,
    /// Due-date delay applied when a failed job is rescheduled
    pub retry_backoff: BackoffPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        let name = "job-executor".to_string();
        Self {
            lock_owner: format!("{name}-{}", Uuid::now_v7()),
            name,
            max_jobs_per_acquisition: 3,
            wait_time: Duration::from_secs(5),
            max_wait: Duration::from_secs(60),
            wait_increase_factor: 2.0,
            wait_after_full_batch: Duration::ZERO,
            lock_duration: Duration::from_secs(300),
            worker_threads: 3,
            queue_capacity: 3,
            shutdown_timeout: Duration::from_secs(30),
            retry_backoff: BackoffPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_owner(mut self, lock_owner: impl Into<String>) -> Self {
        self.lock_owner = lock_owner.into();
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.retry_backoff = policy;
        self
    }

    /// Wait before the next acquisition cycle.
    ///
    /// A full batch suggests more work is pending, so the executor comes back
    /// after `wait_after_full_batch`. A partial batch waits `wait_time`. Each
    /// consecutive empty cycle multiplies `wait_time` by `wait_increase_factor`,
    /// capped at `max_wait`.
    pub fn acquisition_wait(&self, acquired: usize, idle_cycles: u32) -> Duration {
        if acquired >= self.max_jobs_per_acquisition {
            return self.wait_after_full_batch;
        }
        if acquired > 0 {
            return self.wait_time;
        }
        let factor = self.wait_increase_factor.max(1.0).powi(idle_cycles.min(64) as i32);
        let wait_ms = (self.wait_time.as_millis() as f64 * factor)
            .min(self.max_wait.as_millis() as f64)
            .max(0.0);
        Duration::from_millis(wait_ms as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::invalid("max_jobs_per_acquisition", "must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::invalid("worker_threads", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if !(self.wait_increase_factor >= 1.0) {
            return Err(ConfigError::invalid("wait_increase_factor", "must be >= 1.0"));
        }
        if self.lock_owner.trim().is_empty() {
            return Err(ConfigError::invalid("lock_owner", "must not be empty"));
        }
        Ok(())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Re-executions of a command after a retryable transaction conflict
    pub command_retries: u32,
    /// SQLSTATE codes treated as retryable serialization conflicts
    pub retryable_sql_states: Vec<String>,
    /// Error message fragments treated as retryable (case-insensitive)
    pub retryable_error_patterns: Vec<String>,
    /// Retries given to jobs scheduled without an explicit count
    pub default_job_retries: i32,
    /// Re-executions of the failed-job handling command on optimistic locking conflicts
    pub failed_job_command_retries: u32,
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_retries: 3,
            retryable_sql_states: vec!["40001".to_string()],
            retryable_error_patterns: vec!["restart transaction".to_string()],
            default_job_retries: 3,
            failed_job_command_retries: 3,
            job_executor: JobExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries;
        self
    }

    pub fn with_default_job_retries(mut self, retries: i32) -> Self {
        self.default_job_retries = retries;
        self
    }

    pub fn with_job_executor(mut self, job_executor: JobExecutorConfig) -> Self {
        self.job_executor = job_executor;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();
        let source = Lookup(&lookup);

        if let Some(v) = source.parse("FLOWFORGE_COMMAND_RETRIES")? {
            config.command_retries = v;
        }
        if let Some(v) = source.list("FLOWFORGE_RETRYABLE_SQL_STATES") {
            config.retryable_sql_states = v;
        }
        if let Some(v) = source.list("FLOWFORGE_RETRYABLE_ERROR_PATTERNS") {
            config.retryable_error_patterns = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_DEFAULT_JOB_RETRIES")? {
            config.default_job_retries = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_FAILED_JOB_COMMAND_RETRIES")? {
            config.failed_job_command_retries = v;
        }

        let jobs = &mut config.job_executor;
        if let Some(v) = source.raw("FLOWFORGE_JOB_EXECUTOR_NAME") {
            jobs.name = v;
        }
        if let Some(v) = source.raw("FLOWFORGE_JOB_LOCK_OWNER") {
            jobs.lock_owner = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_MAX_JOBS_PER_ACQUISITION")? {
            jobs.max_jobs_per_acquisition = v;
        }
        if let Some(v) = source.millis("FLOWFORGE_WAIT_TIME_MS")? {
            jobs.wait_time = v;
        }
        if let Some(v) = source.millis("FLOWFORGE_MAX_WAIT_MS")? {
            jobs.max_wait = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_WAIT_INCREASE_FACTOR")? {
            jobs.wait_increase_factor = v;
        }
        if let Some(v) = source.millis("FLOWFORGE_WAIT_AFTER_FULL_BATCH_MS")? {
            jobs.wait_after_full_batch = v;
        }
        if let Some(v) = source.millis("FLOWFORGE_LOCK_DURATION_MS")? {
            jobs.lock_duration = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_WORKER_THREADS")? {
            jobs.worker_threads = v;
        }
        if let Some(v) = source.parse("FLOWFORGE_QUEUE_CAPACITY")? {
            jobs.queue_capacity = v;
        }
        if let Some(v) = source.millis("FLOWFORGE_SHUTDOWN_TIMEOUT_MS")? {
            jobs.shutdown_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_job_retries < 0 {
            return Err(ConfigError::invalid("default_job_retries", "must not be negative"));
        }
        self.job_executor.validate()
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|v| v.parse::<T>().map_err(|e| ConfigError::invalid(key, e.to_string())))
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.raw(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}
