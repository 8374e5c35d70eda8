//! Job entity, scheduling requests and the reschedule backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowforge_core::{DbEntity, EngineError, EngineResult, EntityId, EntityKey, EntityType, Revision};

use crate::db::value_field::ByteArrayField;

/// Backoff strategy for rescheduling failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay before a failed job becomes due again.
///
/// The number of attempts is bounded by the job's `retries` counter, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Reschedule immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic per-attempt spread, so schedules are reproducible.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub handler_type: String,
    pub handler_configuration: Value,
    /// `None` means due now.
    pub due_date: Option<DateTime<Utc>>,
    /// `None` takes the engine's `default_job_retries`.
    pub retries: Option<i32>,
    /// Higher priorities are acquired first.
    pub priority: i64,
    pub suspended: bool,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            handler_configuration: Value::Null,
            due_date: None,
            retries: None,
            priority: 0,
            suspended: false,
        }
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.handler_configuration = configuration;
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }
}

/// Persisted job.
///
/// A job is acquirable while it is due, not suspended, has retries left and
/// carries no live lock. Acquisition takes higher priorities first, then the
/// earliest due date. Executing it successfully deletes the row; a failure
/// decrements `retries` and either reschedules it or, at zero, leaves it
/// locked with an incident.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobEntity {
    #[serde(skip)]
    id: Option<EntityId>,
    #[serde(skip)]
    revision: Revision,
    pub handler_type: String,
    #[serde(default)]
    pub handler_configuration: Value,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: i32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub suspended: bool,
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_stacktrace: ByteArrayField,
    pub created_at: DateTime<Utc>,
}

flowforge_core::impl_db_entity!(JobEntity, EntityType::Job, references = JobEntity::referenced_keys);

impl JobEntity {
    pub fn new(job: NewJob, default_retries: i32, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            revision: 0,
            handler_type: job.handler_type,
            handler_configuration: job.handler_configuration,
            due_date: job.due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries: job.retries.unwrap_or(default_retries).max(0),
            attempts: 0,
            priority: job.priority,
            suspended: job.suspended,
            exception_message: None,
            exception_stacktrace: ByteArrayField::default(),
            created_at,
        }
    }

    /// The job's id; every stored or inserted job has one.
    pub fn job_id(&self) -> EngineResult<EntityId> {
        self.id
            .clone()
            .ok_or_else(|| EngineError::invalid_argument("job has no id"))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Locked by someone whose lock has not expired yet.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|until| until > now)
    }

    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }

    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.is_locked(now) && self.retries > 0 && !self.suspended
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration_time = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    fn referenced_keys(&self) -> Vec<EntityKey> {
        self.exception_stacktrace.reference().into_iter().collect()
    }
}

/// Read-only view of a job, safe to hand out of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: EntityId,
    pub revision: Revision,
    pub handler_type: String,
    pub handler_configuration: Value,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: i32,
    pub attempts: u32,
    pub priority: i64,
    pub suspended: bool,
    pub exception_message: Option<String>,
    pub exception_stacktrace_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
}

impl JobInfo {
    pub fn from_entity(job: &JobEntity) -> EngineResult<Self> {
        Ok(Self {
            id: job.job_id()?,
            revision: job.revision(),
            handler_type: job.handler_type.clone(),
            handler_configuration: job.handler_configuration.clone(),
            due_date: job.due_date,
            lock_owner: job.lock_owner.clone(),
            lock_expiration_time: job.lock_expiration_time,
            retries: job.retries,
            attempts: job.attempts,
            priority: job.priority,
            suspended: job.suspended,
            exception_message: job.exception_message.clone(),
            exception_stacktrace_id: job.exception_stacktrace.id().cloned(),
            created_at: job.created_at,
        })
    }
}

/// What a job handler receives.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInvocation {
    pub job_id: EntityId,
    pub handler_type: String,
    pub configuration: Value,
    /// 1-based number of this execution attempt.
    pub attempt: u32,
    pub retries: i32,
}

impl JobInvocation {
    pub fn from_entity(job: &JobEntity) -> EngineResult<Self> {
        Ok(Self {
            job_id: job.job_id()?,
            handler_type: job.handler_type.clone(),
            configuration: job.handler_configuration.clone(),
            attempt: job.attempts + 1,
            retries: job.retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowforge_core::Entity;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(BackoffPolicy::immediate().delay_for_attempt(7), Duration::ZERO);
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy::linear(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn new_job_takes_default_retries() {
        let job = JobEntity::new(NewJob::new("email.send"), 3, at(0));
        assert_eq!(job.retries, 3);
        assert!(job.is_acquirable(at(0)));

        let explicit = JobEntity::new(NewJob::new("email.send").with_retries(1).with_priority(7), 3, at(0));
        assert_eq!(explicit.retries, 1);
        assert_eq!(explicit.priority, 7);
        assert_eq!(job.priority, 0);
    }

    #[test]
    fn acquirability_follows_due_date_lock_retries_and_suspension() {
        let mut job = JobEntity::new(NewJob::new("x").due_at(at(10)), 3, at(0));
        assert!(!job.is_acquirable(at(5)));
        assert!(job.is_acquirable(at(10)));

        job.lock("node-a", at(20));
        assert!(job.is_locked_by("node-a"));
        assert!(!job.is_acquirable(at(15)));
        assert!(job.is_acquirable(at(20)), "expired lock");

        job.unlock();
        job.retries = 0;
        assert!(!job.is_acquirable(at(30)));

        job.retries = 1;
        job.suspended = true;
        assert!(!job.is_acquirable(at(30)));
    }

    #[test]
    fn stored_fields_match_the_acquisition_query() {
        let mut job = JobEntity::new(NewJob::new("x").with_configuration(serde_json::json!({"a": 1})), 2, at(0));
        job.set_id(EntityId::from("j1"));
        let row = job.to_row(1).unwrap();
        for field in ["due_date", "lock_owner", "lock_expiration_time", "retries", "priority", "suspended"] {
            assert!(row.data.get(field).is_some(), "missing {field}");
        }
        assert_eq!(row.data["exception_stacktrace"], Value::Null);

        let loaded = JobEntity::from_row(&row).unwrap();
        assert_eq!(loaded.handler_configuration, serde_json::json!({"a": 1}));
        assert!(loaded.referenced_entities().is_empty());
    }

    #[test]
    fn invocation_counts_the_upcoming_attempt() {
        let mut job = JobEntity::new(NewJob::new("x"), 3, at(0));
        job.set_id(EntityId::from("j1"));
        job.attempts = 2;
        let invocation = JobInvocation::from_entity(&job).unwrap();
        assert_eq!(invocation.attempt, 3);
        assert_eq!(invocation.job_id.as_str(), "j1");
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn backoff_never_exceeds_the_jittered_cap(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..200,
            jitter in 0.0f64..1.0,
        ) {
            let policy = BackoffPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            )
            .with_jitter(jitter);
            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            prop_assert!(delay <= max_ms as f64 * (1.0 + jitter) + 1.0);
        }

        #[test]
        fn exponential_backoff_without_jitter_is_monotonic(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..100,
        ) {
            let policy = BackoffPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            )
            .with_jitter(0.0);
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
        }
    }
}
