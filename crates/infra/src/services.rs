//! Shared engine services.
//!
//! Everything a command context may need beyond its own transaction lives in
//! one `Arc<EngineServices>`, built once by the engine builder and shared by
//! the command executor, every context and the job executor threads.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use flowforge_core::{Clock, EngineError, IdGenerator};

use crate::command::session::SessionFactory;
use crate::config::EngineConfig;
use crate::jobs::handler::JobHandlerRegistry;
use crate::persistence::{ConflictClassifier, Store, StoreError};

pub struct EngineServices {
    config: EngineConfig,
    store: Arc<dyn Store>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ConflictClassifier>,
    job_handlers: JobHandlerRegistry,
    session_factories: Vec<Arc<dyn SessionFactory>>,
    acquisition_signal: AcquisitionSignal,
    in_flight: InFlightCommands,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("config", &self.config)
            .field("job_handlers", &self.job_handlers)
            .field("session_factories", &self.session_factories.len())
            .finish_non_exhaustive()
    }
}

impl EngineServices {
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        id_generator: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        classifier: Arc<dyn ConflictClassifier>,
        job_handlers: JobHandlerRegistry,
        session_factories: Vec<Arc<dyn SessionFactory>>,
    ) -> Self {
        Self {
            config,
            store,
            id_generator,
            clock,
            classifier,
            job_handlers,
            session_factories,
            acquisition_signal: AcquisitionSignal::default(),
            in_flight: InFlightCommands::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn id_generator(&self) -> &dyn IdGenerator {
        self.id_generator.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn classifier(&self) -> &dyn ConflictClassifier {
        self.classifier.as_ref()
    }

    pub fn job_handlers(&self) -> &JobHandlerRegistry {
        &self.job_handlers
    }

    pub fn session_factories(&self) -> &[Arc<dyn SessionFactory>] {
        &self.session_factories
    }

    pub fn acquisition_signal(&self) -> &AcquisitionSignal {
        &self.acquisition_signal
    }

    pub fn in_flight(&self) -> &InFlightCommands {
        &self.in_flight
    }

    /// Translate a store failure raised while a transaction is open.
    pub fn classify(&self, error: StoreError) -> EngineError {
        if self.classifier.is_retryable(&error) {
            EngineError::TransactionRetry(error.to_string())
        } else {
            EngineError::Persistence(error.to_string())
        }
    }

    /// Translate a failed commit. Non-retryable commit failures are fatal.
    pub fn classify_commit(&self, error: StoreError) -> EngineError {
        if self.classifier.is_retryable(&error) {
            EngineError::TransactionRetry(error.to_string())
        } else {
            EngineError::FatalTransaction(error.to_string())
        }
    }
}

/// Wake-up signal for the acquisition thread.
///
/// Raised after a transaction commits a job that is already due, so the
/// executor does not sleep through its full idle wait.
#[derive(Debug, Default)]
pub struct AcquisitionSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl AcquisitionSignal {
    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = true;
        self.cond.notify_all();
    }

    /// Block until notified or `timeout` elapses. Returns true if notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *pending, false)
    }
}

/// Process-wide count of commands currently inside the pipeline.
#[derive(Debug, Default)]
pub struct InFlightCommands {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlightCommands {
    pub fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        InFlightGuard { counter: self }
    }

    /// Wait until no command is in flight. Returns false on timeout.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .drained
                .wait_timeout(count, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

pub(crate) struct InFlightGuard<'a> {
    counter: &'a InFlightCommands,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.counter.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counter.drained.notify_all();
        }
    }
}
