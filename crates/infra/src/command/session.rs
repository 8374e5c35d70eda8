//! Per-context sessions resolved through an explicit factory registry.
//!
//! A session is any piece of state that lives exactly as long as one command
//! context (an outbox, a batch writer, a read-through cache). Factories are
//! registered once on the engine builder; the context opens a session lazily
//! on first use, flushes it before the entity cache and closes it together
//! with the context.

use std::any::{Any, TypeId};
use std::marker::PhantomData;

use flowforge_core::EngineResult;

use super::context::CommandContext;

pub trait Session: Any {
    /// Write buffered state. Runs after close listeners, before the entity flush.
    fn flush(&mut self, _ctx: &CommandContext) -> EngineResult<()> {
        Ok(())
    }

    /// Release resources. Runs on success and on failure.
    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait SessionFactory: Send + Sync {
    /// `TypeId` of the session this factory opens.
    fn session_type(&self) -> TypeId;

    fn open_session(&self) -> Box<dyn Session>;
}

/// Factory backed by a constructor closure.
pub struct FnSessionFactory<S, F> {
    make: F,
    _session: PhantomData<fn() -> S>,
}

impl<S, F> FnSessionFactory<S, F>
where
    S: Session,
    F: Fn() -> S + Send + Sync,
{
    pub fn new(make: F) -> Self {
        Self {
            make,
            _session: PhantomData,
        }
    }
}

impl<S, F> SessionFactory for FnSessionFactory<S, F>
where
    S: Session,
    F: Fn() -> S + Send + Sync,
{
    fn session_type(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn open_session(&self) -> Box<dyn Session> {
        Box::new((self.make)())
    }
}
