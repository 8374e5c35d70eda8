//! Command execution pipeline.
//!
//! A command is a unit of work executed inside exactly one store transaction.
//! The [`CommandExecutor`] runs every command through a fixed interceptor
//! chain:
//!
//! ```text
//! Command
//!   ↓
//! 1. Logging          (span + entry/exit events)
//!   ↓
//! 2. Command counter  (in-flight count, drained on shutdown)
//!   ↓
//! 3. Retry            (re-runs 4..6 on retryable conflicts, bounded)
//!   ↓
//! 4. Transaction      (begin / commit / rollback, commit failure classification)
//!   ↓
//! 5. Context          (create + push the CommandContext, pop on every exit path)
//!   ↓
//!    custom interceptors
//!   ↓
//! 6. Execution        (run the command, close the context: listeners, flush)
//! ```
//!
//! A command started while another command's context is active on the same
//! thread is **nested**: it skips retry and transaction handling, joins the
//! caller's transaction and reuses its context, cache and sessions.
//!
//! Commands must be re-executable from their inputs (`execute` takes `&self`);
//! the retry stage may run them several times, each time against a fresh
//! context and transaction.

pub mod context;
pub mod executor;
pub mod interceptor;
pub mod session;

use std::any::Any;
use std::marker::PhantomData;

use flowforge_core::EngineResult;

pub use context::{
    CommandContext, CommandContextListener, ContextState, TransactionContext, TransactionState,
};
pub use executor::CommandExecutor;
pub use interceptor::{CommandInterceptor, Invocation, Next};
pub use session::{FnSessionFactory, Session, SessionFactory};

pub trait Command {
    type Output: 'static;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<Self::Output>;

    /// Name used in logs.
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Whether an optimistic locking failure should re-run this command from
    /// scratch, like a retryable transaction conflict.
    fn retry_on_optimistic_locking(&self) -> bool {
        false
    }
}

/// Command built from a closure.
pub struct FnCommand<F, T> {
    name: &'static str,
    f: F,
    retry_on_optimistic_locking: bool,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> FnCommand<F, T>
where
    F: Fn(&CommandContext) -> EngineResult<T>,
    T: 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            retry_on_optimistic_locking: false,
            _output: PhantomData,
        }
    }

    pub fn retrying_on_optimistic_locking(mut self) -> Self {
        self.retry_on_optimistic_locking = true;
        self
    }
}

impl<F, T> Command for FnCommand<F, T>
where
    F: Fn(&CommandContext) -> EngineResult<T>,
    T: 'static,
{
    type Output = T;

    fn execute(&self, ctx: &CommandContext) -> EngineResult<T> {
        (self.f)(ctx)
    }

    fn name(&self) -> &str {
        self.name
    }

    fn retry_on_optimistic_locking(&self) -> bool {
        self.retry_on_optimistic_locking
    }
}

/// Object-safe form of [`Command`] carried through the interceptor chain.
pub(crate) trait ErasedCommand {
    fn name(&self) -> &str;
    fn retry_on_optimistic_locking(&self) -> bool;
    fn execute_erased(&self, ctx: &CommandContext) -> EngineResult<Box<dyn Any>>;
}

impl<C: Command> ErasedCommand for C {
    fn name(&self) -> &str {
        Command::name(self)
    }

    fn retry_on_optimistic_locking(&self) -> bool {
        Command::retry_on_optimistic_locking(self)
    }

    fn execute_erased(&self, ctx: &CommandContext) -> EngineResult<Box<dyn Any>> {
        let output = self.execute(ctx)?;
        Ok(Box::new(output))
    }
}
