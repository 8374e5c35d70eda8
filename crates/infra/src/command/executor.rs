use std::sync::{Arc, Weak};

use flowforge_core::{EngineError, EngineResult};

use crate::services::EngineServices;

use super::context::{self, CommandContext};
use super::interceptor::{
    CommandCounterInterceptor, CommandInterceptor, ContextInterceptor, ExecutionInterceptor,
    Invocation, LoggingInterceptor, Next, RetryInterceptor, TransactionInterceptor,
};
use super::{Command, FnCommand};

/// Entry point for running commands through the interceptor chain.
pub struct CommandExecutor {
    services: Arc<EngineServices>,
    chain: Vec<Arc<dyn CommandInterceptor>>,
    this: Weak<CommandExecutor>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.chain.iter().map(|i| i.name()).collect();
        f.debug_struct("CommandExecutor")
            .field("chain", &names)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Build the fixed chain; `custom` interceptors run inside the context,
    /// just before execution.
    pub(crate) fn new(
        services: Arc<EngineServices>,
        custom: Vec<Arc<dyn CommandInterceptor>>,
    ) -> Arc<Self> {
        let mut chain: Vec<Arc<dyn CommandInterceptor>> = vec![
            Arc::new(LoggingInterceptor),
            Arc::new(CommandCounterInterceptor),
            Arc::new(RetryInterceptor),
            Arc::new(TransactionInterceptor),
            Arc::new(ContextInterceptor),
        ];
        chain.extend(custom);
        chain.push(Arc::new(ExecutionInterceptor));

        Arc::new_cyclic(|this| Self {
            services,
            chain,
            this: this.clone(),
        })
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Run `command`. Nested when a command context is already active on the
    /// calling thread, top-level otherwise.
    pub fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        let mut invocation = Invocation::new(
            &command,
            self.services.clone(),
            self.this.clone(),
            context::current(),
        );
        let output = Next::new(&self.chain).proceed(&mut invocation)?;
        output.downcast::<C::Output>().map(|b| *b).map_err(|_| {
            EngineError::command(format!(
                "{} returned an unexpected output type",
                Command::name(&command)
            ))
        })
    }

    /// Run a closure as a command.
    pub fn execute_fn<T, F>(&self, name: &'static str, f: F) -> EngineResult<T>
    where
        T: 'static,
        F: Fn(&CommandContext) -> EngineResult<T>,
    {
        self.execute(FnCommand::new(name, f))
    }
}
