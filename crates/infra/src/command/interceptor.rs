//! Interceptor chain stages.
//!
//! Each stage receives the [`Invocation`] and a [`Next`] handle for the rest
//! of the chain. A stage may proceed zero, one or several times (retry), and
//! must leave the invocation in a consistent state whatever the outcome.

use std::any::Any;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use tracing::{debug, debug_span, warn};

use flowforge_core::{EngineError, EngineResult};

use crate::services::EngineServices;

use super::context::{self, CommandContext, ContextState, TransactionContext};
use super::executor::CommandExecutor;
use super::ErasedCommand;

pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, invocation: &mut Invocation<'_>, next: Next<'_>)
    -> EngineResult<Box<dyn Any>>;
}

/// The remaining interceptors after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn CommandInterceptor>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn CommandInterceptor>]) -> Self {
        Self { chain }
    }

    pub fn proceed(self, invocation: &mut Invocation<'_>) -> EngineResult<Box<dyn Any>> {
        match self.chain.split_first() {
            Some((head, rest)) => head.execute(invocation, Next::new(rest)),
            None => Err(EngineError::command(format!(
                "interceptor chain ended before executing {}",
                invocation.command_name()
            ))),
        }
    }
}

/// One pass of a command through the chain.
pub struct Invocation<'a> {
    command: &'a dyn ErasedCommand,
    services: Arc<EngineServices>,
    executor: Weak<CommandExecutor>,
    transaction: Option<Rc<TransactionContext>>,
    context: Option<Rc<CommandContext>>,
    nested: bool,
    attempt: u32,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        command: &'a dyn ErasedCommand,
        services: Arc<EngineServices>,
        executor: Weak<CommandExecutor>,
        current: Option<Rc<CommandContext>>,
    ) -> Self {
        let nested = current.is_some();
        let transaction = current.as_ref().map(|ctx| ctx.transaction().clone());
        Self {
            command,
            services,
            executor,
            transaction,
            context: current,
            nested,
            attempt: 1,
        }
    }

    pub fn command_name(&self) -> &'a str {
        self.command.name()
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn context(&self) -> Option<&Rc<CommandContext>> {
        self.context.as_ref()
    }

    /// 1-based attempt number of the current pass.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub struct LoggingInterceptor;

impl CommandInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        let command = invocation.command_name();
        let span = debug_span!("command", command, nested = invocation.is_nested());
        let _entered = span.enter();

        debug!("command started");
        let result = next.proceed(invocation);
        match &result {
            Ok(_) => debug!("command finished"),
            Err(e) => debug!(error = %e, "command failed"),
        }
        result
    }
}

/// Tracks in-flight commands so shutdown can wait for them.
pub struct CommandCounterInterceptor;

impl CommandInterceptor for CommandCounterInterceptor {
    fn name(&self) -> &'static str {
        "command-counter"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        let services = invocation.services().clone();
        let _guard = services.in_flight().enter();
        next.proceed(invocation)
    }
}

/// Re-runs the rest of the chain on retryable transaction conflicts.
///
/// Each attempt gets a fresh transaction and context. Optimistic locking
/// failures are retried only for commands that opt in.
pub struct RetryInterceptor;

impl CommandInterceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        if invocation.is_nested() {
            return next.proceed(invocation);
        }

        let max_retries = invocation.services().config().command_retries;
        let retry_locking = invocation.command.retry_on_optimistic_locking();
        let mut retries_left = max_retries;

        loop {
            let error = match next.proceed(invocation) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable = error.is_retryable_transaction()
                || (retry_locking && error.is_optimistic_locking());
            if !retryable {
                return Err(error);
            }

            if retries_left == 0 {
                warn!(
                    command = invocation.command_name(),
                    attempts = invocation.attempt,
                    error = %error,
                    "command retries exhausted"
                );
                return Err(match error {
                    EngineError::TransactionRetry(message) => EngineError::FatalTransaction(
                        format!("retries exhausted after {} attempts: {message}", invocation.attempt),
                    ),
                    other => other,
                });
            }

            retries_left -= 1;
            invocation.attempt += 1;
            debug!(
                command = invocation.command_name(),
                attempt = invocation.attempt,
                error = %error,
                "retrying command"
            );
        }
    }
}

/// Opens and finishes the store transaction of a top-level command.
///
/// Commits after the inner stages returned, which means after the context
/// closed; commit failures reach transaction listeners only.
pub struct TransactionInterceptor;

impl CommandInterceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        if invocation.transaction.is_some() {
            return next.proceed(invocation);
        }

        let services = invocation.services().clone();
        let tx = services.store().begin().map_err(|e| services.classify(e))?;
        let transaction = Rc::new(TransactionContext::new(tx));
        invocation.transaction = Some(transaction.clone());

        let result = next.proceed(invocation);
        invocation.transaction = None;

        match result {
            Ok(value) => {
                transaction
                    .commit()
                    .map_err(|e| services.classify_commit(e))?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = transaction.rollback() {
                    warn!(
                        command = invocation.command_name(),
                        error = %rollback_error,
                        "rollback failed"
                    );
                }
                Err(error)
            }
        }
    }
}

/// Creates the command context and makes it the thread's current context.
pub struct ContextInterceptor;

impl CommandInterceptor for ContextInterceptor {
    fn name(&self) -> &'static str {
        "context"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        if invocation.is_nested() {
            return next.proceed(invocation);
        }

        let transaction = invocation
            .transaction
            .clone()
            .ok_or_else(|| EngineError::command("context created without a transaction"))?;
        let ctx = Rc::new(CommandContext::new(
            invocation.services().clone(),
            transaction,
            invocation.executor.clone(),
        ));
        invocation.context = Some(ctx.clone());
        let _guard = context::push(ctx.clone());

        let result = next.proceed(invocation);
        invocation.context = None;

        // A custom interceptor failing before execution leaves the context open.
        if ctx.state() != ContextState::Closed {
            return ctx.close(result);
        }
        result
    }
}

/// Last stage: runs the command and closes a top-level context.
pub struct ExecutionInterceptor;

impl CommandInterceptor for ExecutionInterceptor {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        _next: Next<'_>,
    ) -> EngineResult<Box<dyn Any>> {
        let ctx = invocation
            .context()
            .cloned()
            .ok_or_else(|| EngineError::command("no command context to execute in"))?;

        let result = ctx.run(invocation.command);
        if invocation.is_nested() {
            result
        } else {
            ctx.close(result)
        }
    }
}
