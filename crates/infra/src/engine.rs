//! Engine wiring: builder, process engine and management service.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use flowforge_core::{Clock, EngineError, EngineResult, EntityId, IdGenerator, SystemClock, UuidV7IdGenerator};

use crate::command::context::CommandContext;
use crate::command::interceptor::CommandInterceptor;
use crate::command::session::SessionFactory;
use crate::command::{Command, CommandExecutor};
use crate::config::{ConfigError, EngineConfig};
use crate::jobs::commands::{
    DeleteJobCmd, ExecuteJobCmd, ExecutionResult, GetJobCmd, GetJobExceptionStacktraceCmd,
    HandleFailedJobCmd, ListIncidentsCmd, ListJobsCmd, ScheduleJobCmd, SetJobDuedateCmd,
    SetJobPriorityCmd, SetJobRetriesCmd, SuspendJobCmd,
};
use crate::jobs::executor::{JobExecutor, JobExecutorHandle};
use crate::jobs::handler::JobHandlerRegistry;
use crate::jobs::incident::IncidentInfo;
use crate::jobs::types::{JobInfo, JobInvocation, NewJob};
use crate::persistence::{ConflictClassifier, SqlStateClassifier, Store};
use crate::services::EngineServices;

pub struct ProcessEngineBuilder {
    store: Arc<dyn Store>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn IdGenerator>,
    classifier: Option<Arc<dyn ConflictClassifier>>,
    job_handlers: JobHandlerRegistry,
    session_factories: Vec<Arc<dyn SessionFactory>>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

impl ProcessEngineBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(UuidV7IdGenerator),
            classifier: None,
            job_handlers: JobHandlerRegistry::new(),
            session_factories: Vec::new(),
            interceptors: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Replace the classifier built from `retryable_sql_states` and
    /// `retryable_error_patterns`.
    pub fn classifier(mut self, classifier: Arc<dyn ConflictClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn job_handler<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CommandContext, &JobInvocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.job_handlers.register(pattern, handler);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factories.push(factory);
        self
    }

    /// Add an interceptor running inside the command context, before execution.
    pub fn interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<ProcessEngine, ConfigError> {
        self.config.validate()?;

        let classifier = self.classifier.unwrap_or_else(|| {
            Arc::new(SqlStateClassifier::new(
                self.config.retryable_sql_states.clone(),
                self.config.retryable_error_patterns.clone(),
            ))
        });

        let services = Arc::new(EngineServices::new(
            self.config,
            self.store,
            self.id_generator,
            self.clock,
            classifier,
            self.job_handlers,
            self.session_factories,
        ));
        let commands = CommandExecutor::new(services.clone(), self.interceptors);
        let job_executor = Arc::new(JobExecutor::new(commands.clone()));

        info!(
            executor = %services.config().job_executor.name,
            handlers = services.job_handlers().len(),
            "process engine built"
        );

        Ok(ProcessEngine {
            services,
            commands,
            job_executor,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    commands: Arc<CommandExecutor>,
    job_executor: Arc<JobExecutor>,
}

impl ProcessEngine {
    pub fn builder(store: Arc<dyn Store>) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(store)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn command_executor(&self) -> &Arc<CommandExecutor> {
        &self.commands
    }

    pub fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        self.commands.execute(command)
    }

    pub fn management_service(&self) -> ManagementService {
        ManagementService {
            commands: self.commands.clone(),
        }
    }

    /// The executor for synchronous stepping (`run_acquisition_cycle`,
    /// `execute_acquired`).
    pub fn job_executor(&self) -> &Arc<JobExecutor> {
        &self.job_executor
    }

    /// Start the background acquisition thread and worker pool.
    pub fn start_job_executor(&self) -> EngineResult<JobExecutorHandle> {
        self.job_executor.clone().spawn()
    }
}

/// Operator-facing job and incident operations.
#[derive(Debug, Clone)]
pub struct ManagementService {
    commands: Arc<CommandExecutor>,
}

impl ManagementService {
    pub fn schedule_job(&self, job: NewJob) -> EngineResult<JobInfo> {
        self.commands.execute(ScheduleJobCmd(job))
    }

    pub fn job(&self, id: &EntityId) -> EngineResult<Option<JobInfo>> {
        self.commands.execute(GetJobCmd(id.clone()))
    }

    pub fn jobs(&self) -> EngineResult<Vec<JobInfo>> {
        self.commands.execute(ListJobsCmd)
    }

    /// Execute a job now on the calling thread, ignoring locks and due date.
    ///
    /// A handler failure is recorded like an executor failure (retries - 1,
    /// backoff or incident) and then returned.
    pub fn execute_job(&self, id: &EntityId) -> EngineResult<()> {
        let result = self.commands.execute(ExecuteJobCmd {
            job_id: id.clone(),
            lock_owner: None,
        });
        match result {
            Ok(ExecutionResult::Succeeded) => Ok(()),
            Ok(ExecutionResult::Skipped) => Err(EngineError::not_found(format!("job {id}"))),
            Err(e) if e.is_conflict() => Err(e),
            Err(e) => {
                let recorded = self.commands.execute(HandleFailedJobCmd {
                    job_id: id.clone(),
                    lock_owner: None,
                    message: e.message(),
                    details: e.details(),
                });
                if let Err(record_error) = recorded {
                    warn!(job_id = %id, error = %record_error, "could not record job failure");
                }
                Err(e)
            }
        }
    }

    /// Set retries; raising them from 0 resolves the job's incidents.
    pub fn set_job_retries(&self, id: &EntityId, retries: i32) -> EngineResult<()> {
        self.commands.execute(SetJobRetriesCmd {
            job_id: id.clone(),
            retries,
        })
    }

    /// Higher priorities are acquired first.
    pub fn set_job_priority(&self, id: &EntityId, priority: i64) -> EngineResult<()> {
        self.commands.execute(SetJobPriorityCmd {
            job_id: id.clone(),
            priority,
        })
    }

    /// `None` makes the job due immediately.
    pub fn set_job_duedate(&self, id: &EntityId, due_date: Option<DateTime<Utc>>) -> EngineResult<()> {
        self.commands.execute(SetJobDuedateCmd {
            job_id: id.clone(),
            due_date,
        })
    }

    pub fn delete_job(&self, id: &EntityId) -> EngineResult<bool> {
        self.commands.execute(DeleteJobCmd(id.clone()))
    }

    pub fn suspend_job(&self, id: &EntityId) -> EngineResult<()> {
        self.commands.execute(SuspendJobCmd {
            job_id: id.clone(),
            suspended: true,
        })
    }

    pub fn activate_job(&self, id: &EntityId) -> EngineResult<()> {
        self.commands.execute(SuspendJobCmd {
            job_id: id.clone(),
            suspended: false,
        })
    }

    pub fn job_exception_stacktrace(&self, id: &EntityId) -> EngineResult<Option<String>> {
        self.commands.execute(GetJobExceptionStacktraceCmd(id.clone()))
    }

    pub fn incidents(&self) -> EngineResult<Vec<IncidentInfo>> {
        self.commands.execute(ListIncidentsCmd)
    }
}
