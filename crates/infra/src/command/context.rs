//! Command context, transaction context and the ambient context stack.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tracing::warn;

use flowforge_core::{EngineError, EngineResult};

use crate::db::byte_array::ByteArrayManager;
use crate::db::entity_manager::EntityManager;
use crate::jobs::incident::IncidentManager;
use crate::jobs::manager::JobManager;
use crate::persistence::{StoreError, StoreTransaction};
use crate::services::EngineServices;
use crate::variables::VariableManager;

use super::executor::CommandExecutor;
use super::session::Session;
use super::{Command, ErasedCommand};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Rc<CommandContext>>> = const { RefCell::new(Vec::new()) };
}

/// The innermost command context active on this thread, if any.
pub fn current() -> Option<Rc<CommandContext>> {
    CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Like [`current`], failing with `NoActiveContext` outside a command.
pub fn require_current(operation: &str) -> EngineResult<Rc<CommandContext>> {
    current().ok_or_else(|| EngineError::no_active_context(operation))
}

/// Push `ctx` for the lifetime of the returned guard.
pub(crate) fn push(ctx: Rc<CommandContext>) -> ContextGuard {
    CONTEXT_STACK.with(|stack| stack.borrow_mut().push(ctx));
    ContextGuard {
        _not_send: PhantomData,
    }
}

/// Pops the context pushed with it, on normal return, `?` and unwinding alike.
pub(crate) struct ContextGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = CONTEXT_STACK.try_with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Committed,
    RolledBack,
}

type TransactionListener = Box<dyn FnOnce()>;

/// The store transaction shared by a top-level command and its nested commands.
pub struct TransactionContext {
    transaction: RefCell<Option<Box<dyn StoreTransaction>>>,
    listeners: RefCell<Vec<(TransactionState, TransactionListener)>>,
}

impl TransactionContext {
    pub(crate) fn new(transaction: Box<dyn StoreTransaction>) -> Self {
        Self {
            transaction: RefCell::new(Some(transaction)),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.transaction.borrow().is_some()
    }

    /// Run `f` against the open store transaction.
    pub fn with_transaction<R>(
        &self,
        f: impl FnOnce(&mut dyn StoreTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self
            .transaction
            .try_borrow_mut()
            .map_err(|_| StoreError::Connection("store transaction is already in use".into()))?;
        match guard.as_deref_mut() {
            Some(tx) => f(tx),
            None => Err(StoreError::TransactionClosed),
        }
    }

    /// Run `f` once the transaction reaches `state`. Listeners run after the
    /// store call returned, outside any transaction. `RolledBack` also fires
    /// when the commit itself fails.
    pub fn add_listener(&self, state: TransactionState, f: impl FnOnce() + 'static) {
        self.listeners.borrow_mut().push((state, Box::new(f)));
    }

    pub(crate) fn commit(&self) -> Result<(), StoreError> {
        let tx = self
            .transaction
            .borrow_mut()
            .take()
            .ok_or(StoreError::TransactionClosed)?;
        match tx.commit() {
            Ok(()) => {
                self.fire(TransactionState::Committed);
                Ok(())
            }
            Err(e) => {
                self.fire(TransactionState::RolledBack);
                Err(e)
            }
        }
    }

    pub(crate) fn rollback(&self) -> Result<(), StoreError> {
        let Some(tx) = self.transaction.borrow_mut().take() else {
            return Ok(());
        };
        let result = tx.rollback();
        self.fire(TransactionState::RolledBack);
        result
    }

    fn fire(&self, state: TransactionState) {
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for (wanted, listener) in listeners {
            if wanted == state {
                listener();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Executing,
    Closing,
    Closed,
}

/// Callbacks around the end of a command context.
pub trait CommandContextListener {
    /// Runs on successful completion, before sessions and the entity cache
    /// are flushed. Listeners may register further listeners.
    fn on_close(&self, _ctx: &CommandContext) -> EngineResult<()> {
        Ok(())
    }

    /// Runs exactly once when the command, or the close itself, failed.
    ///
    /// The commit happens after the context closed, so a failed commit is not
    /// reported here. Use a [`TransactionState::RolledBack`] transaction
    /// listener to observe it.
    fn on_failure(&self, _ctx: &CommandContext, _error: &EngineError) {}
}

/// Per-unit-of-work state: entity cache, sessions and listeners.
///
/// Created once per top-level command and reused by nested commands on the
/// same thread. A context never leaves the thread that created it.
pub struct CommandContext {
    services: Arc<EngineServices>,
    transaction: Rc<TransactionContext>,
    entity_manager: EntityManager,
    executor: Weak<CommandExecutor>,
    sessions: RefCell<HashMap<TypeId, Box<dyn Session>>>,
    listeners: RefCell<Vec<Rc<dyn CommandContextListener>>>,
    state: Cell<ContextState>,
    failure_reported: Cell<bool>,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("state", &self.state.get())
            .field("listeners", &self.listeners.borrow().len())
            .field("sessions", &self.sessions.borrow().len())
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    pub(crate) fn new(
        services: Arc<EngineServices>,
        transaction: Rc<TransactionContext>,
        executor: Weak<CommandExecutor>,
    ) -> Self {
        let entity_manager = EntityManager::new(services.clone(), transaction.clone());
        Self {
            services,
            transaction,
            entity_manager,
            executor,
            sessions: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            state: Cell::new(ContextState::Open),
            failure_reported: Cell::new(false),
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn transaction(&self) -> &Rc<TransactionContext> {
        &self.transaction
    }

    pub fn entity_manager(&self) -> &EntityManager {
        &self.entity_manager
    }

    pub fn state(&self) -> ContextState {
        self.state.get()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock().now()
    }

    pub fn job_manager(&self) -> JobManager<'_> {
        JobManager::new(self)
    }

    pub fn incident_manager(&self) -> IncidentManager<'_> {
        IncidentManager::new(self)
    }

    pub fn byte_array_manager(&self) -> ByteArrayManager<'_> {
        ByteArrayManager::new(self)
    }

    pub fn variable_manager(&self) -> VariableManager<'_> {
        VariableManager::new(self)
    }

    pub fn add_listener(&self, listener: Rc<dyn CommandContextListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    pub fn add_transaction_listener(&self, state: TransactionState, f: impl FnOnce() + 'static) {
        self.transaction.add_listener(state, f);
    }

    /// Run `f` with the session of type `S`, opening it on first use.
    ///
    /// `f` must not request another session.
    pub fn with_session<S, R>(&self, f: impl FnOnce(&mut S) -> R) -> EngineResult<R>
    where
        S: Session,
    {
        let type_id = TypeId::of::<S>();
        let mut sessions = self
            .sessions
            .try_borrow_mut()
            .map_err(|_| EngineError::command("session registry is already in use"))?;

        if !sessions.contains_key(&type_id) {
            let factory = self
                .services
                .session_factories()
                .iter()
                .find(|factory| factory.session_type() == type_id)
                .ok_or_else(|| {
                    EngineError::invalid_argument(format!(
                        "no session factory registered for {}",
                        std::any::type_name::<S>()
                    ))
                })?;
            sessions.insert(type_id, factory.open_session());
        }

        let session = sessions
            .get_mut(&type_id)
            .and_then(|s| s.as_any_mut().downcast_mut::<S>())
            .ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "session factory opened the wrong type for {}",
                    std::any::type_name::<S>()
                ))
            })?;
        Ok(f(session))
    }

    /// Execute `command` nested in this context's transaction.
    pub fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        let executor = self
            .executor
            .upgrade()
            .ok_or(EngineError::ShuttingDown)?;
        executor.execute(command)
    }

    pub(crate) fn run(&self, command: &dyn ErasedCommand) -> EngineResult<Box<dyn Any>> {
        if self.state.get() == ContextState::Open {
            self.state.set(ContextState::Executing);
        }
        command.execute_erased(self)
    }

    /// Finish the unit of work: on success run close listeners, flush sessions
    /// and the entity cache; on any failure notify failure listeners once.
    pub(crate) fn close(&self, result: EngineResult<Box<dyn Any>>) -> EngineResult<Box<dyn Any>> {
        let result = match result {
            Ok(value) => {
                self.state.set(ContextState::Closing);
                self.flush_on_close().map(|()| value)
            }
            Err(e) => Err(e),
        };

        self.close_sessions();
        self.state.set(ContextState::Closed);

        if let Err(error) = &result {
            self.report_failure(error);
        }
        result
    }

    fn flush_on_close(&self) -> EngineResult<()> {
        let mut index = 0;
        loop {
            let listener = self.listeners.borrow().get(index).cloned();
            let Some(listener) = listener else {
                break;
            };
            listener.on_close(self)?;
            index += 1;
        }

        self.flush_sessions()?;
        self.entity_manager.flush()
    }

    fn flush_sessions(&self) -> EngineResult<()> {
        let mut sessions = std::mem::take(&mut *self.sessions.borrow_mut());
        let result = sessions.values_mut().try_for_each(|s| s.flush(self));

        let mut current = self.sessions.borrow_mut();
        for (type_id, session) in sessions {
            current.entry(type_id).or_insert(session);
        }
        result
    }

    fn close_sessions(&self) {
        let sessions = std::mem::take(&mut *self.sessions.borrow_mut());
        for (_, mut session) in sessions {
            session.close();
        }
    }

    fn report_failure(&self, error: &EngineError) {
        if self.failure_reported.replace(true) {
            return;
        }
        let listeners: Vec<_> = self.listeners.borrow().clone();
        for listener in listeners {
            listener.on_failure(self, error);
        }
        if self.transaction.is_active() {
            warn!(error = %error, "command context failed with an open transaction");
        }
    }
}
