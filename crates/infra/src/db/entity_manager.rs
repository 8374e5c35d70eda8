//! Entity manager: the command context's view of the store.
//!
//! Reads go through the [`EntityCache`] first, so one context never holds two
//! instances of the same row. Writes are deferred until [`EntityManager::flush`]
//! (normally run by the context on close) except for
//! [`EntityManager::flush_entity`], which writes one entity immediately and
//! reports a lost race instead of failing the command.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use flowforge_core::{DbEntity, EngineError, EngineResult, Entity, EntityId, EntityKey, EntityRow};

use crate::command::context::TransactionContext;
use crate::persistence::{StoreError, StoreTransaction};
use crate::services::EngineServices;

use super::cache::{CacheLookup, EntityCache, EntityState, FlushOperation};

/// Result of [`EntityManager::flush_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since load.
    Unchanged,
    Applied,
    /// Another transaction changed or locked the row; the entity was evicted.
    Conflict,
}

pub struct EntityManager {
    services: Arc<EngineServices>,
    transaction: Rc<TransactionContext>,
    cache: RefCell<EntityCache>,
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("cached", &self.cache.borrow().len())
            .finish_non_exhaustive()
    }
}

fn key_of<T: Entity>(entity: &RefCell<T>) -> EngineResult<EntityKey> {
    entity
        .borrow()
        .key()
        .ok_or_else(|| EngineError::invalid_argument(format!("{} entity has no id", T::TYPE)))
}

impl EntityManager {
    pub(crate) fn new(services: Arc<EngineServices>, transaction: Rc<TransactionContext>) -> Self {
        Self {
            services,
            transaction,
            cache: RefCell::new(EntityCache::new()),
        }
    }

    /// Register a new entity. Assigns an id when it has none and starts the
    /// revision at 1; the row is written at the next flush.
    pub fn insert<T: Entity>(&self, mut entity: T) -> EngineResult<Rc<RefCell<T>>> {
        if entity.id().is_none() {
            entity.set_id(self.services.id_generator().next_id());
        }
        entity.set_revision(1);
        let entity = Rc::new(RefCell::new(entity));
        self.cache.borrow_mut().put_transient(entity.clone())?;
        Ok(entity)
    }

    pub fn select_by_id<T: Entity>(&self, id: &EntityId) -> EngineResult<Option<Rc<RefCell<T>>>> {
        let key = EntityKey::new(T::TYPE, id.clone());
        let lookup = self.cache.borrow().get::<T>(&key)?;
        match lookup {
            CacheLookup::Hit(entity) => Ok(Some(entity)),
            CacheLookup::Deleted => Ok(None),
            CacheLookup::Miss => {
                let row = self.read(|tx| tx.select_by_id(&key))?;
                match row {
                    Some(row) => self.adopt(&row),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn select_all<T: Entity>(&self) -> EngineResult<Vec<Rc<RefCell<T>>>> {
        self.select_with(|tx| tx.select_by_type(T::TYPE), |_| true)
    }

    /// Entities whose stored string field `field` equals `value`. `matches`
    /// re-checks cached instances, which may have changed since load.
    pub fn select_by_field<T: Entity>(
        &self,
        field: &str,
        value: &str,
        matches: impl Fn(&T) -> bool,
    ) -> EngineResult<Vec<Rc<RefCell<T>>>> {
        self.select_with(|tx| tx.select_by_field(T::TYPE, field, value), matches)
    }

    /// Merge a store query with the cache.
    ///
    /// Stored rows already cached resolve to the cached instance; deleted
    /// entries are dropped; transient entities matching `matches` are appended
    /// in creation order.
    pub fn select_with<T: Entity>(
        &self,
        fetch: impl FnOnce(&mut dyn StoreTransaction) -> Result<Vec<EntityRow>, StoreError>,
        matches: impl Fn(&T) -> bool,
    ) -> EngineResult<Vec<Rc<RefCell<T>>>> {
        let rows = self.read(fetch)?;

        let mut found = Vec::with_capacity(rows.len());
        let mut seen = std::collections::HashSet::new();
        for row in &rows {
            if let Some(entity) = self.adopt::<T>(row)? {
                if matches(&entity.borrow()) {
                    seen.insert(row.key.clone());
                    found.push(entity);
                }
            }
        }

        let cached = self.cache.borrow().entities_of::<T>();
        for entity in cached {
            let key = key_of(&entity)?;
            if !seen.contains(&key) && matches(&entity.borrow()) {
                seen.insert(key);
                found.push(entity);
            }
        }
        Ok(found)
    }

    /// Mark an entity deleted. Reads in this context no longer see it.
    pub fn delete<T: Entity>(&self, entity: &Rc<RefCell<T>>) -> EngineResult<()> {
        let key = key_of(entity)?;
        self.cache.borrow_mut().mark_deleted(&key)
    }

    /// Drop a cached entity without writing it.
    pub fn evict(&self, key: &EntityKey) {
        self.cache.borrow_mut().evict(key);
    }

    pub fn state(&self, key: &EntityKey) -> Option<EntityState> {
        self.cache.borrow().state(key)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Write every pending insert, update and delete, in dependency order.
    pub fn flush(&self) -> EngineResult<()> {
        let plan = self.cache.borrow().flush_plan()?;
        if plan.is_empty() {
            return Ok(());
        }
        debug!(operations = plan.len(), "flushing entity cache");
        for op in &plan {
            self.apply(op)?;
            self.cache.borrow_mut().mark_flushed(op)?;
        }
        Ok(())
    }

    /// Write one loaded entity now. A zero-row update evicts the entity and
    /// reports [`FlushOutcome::Conflict`].
    pub fn flush_entity<T: Entity>(&self, entity: &Rc<RefCell<T>>) -> EngineResult<FlushOutcome> {
        let key = key_of(entity)?;
        let pending = self.cache.borrow().pending_update(&key)?;
        let Some(op) = pending else {
            return Ok(FlushOutcome::Unchanged);
        };
        match self.apply(&op) {
            Ok(()) => {
                self.cache.borrow_mut().mark_flushed(&op)?;
                Ok(FlushOutcome::Applied)
            }
            Err(EngineError::OptimisticLocking(message)) => {
                debug!(entity = %key, %message, "immediate flush lost a race");
                self.evict(&key);
                Ok(FlushOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    fn adopt<T: Entity>(&self, row: &EntityRow) -> EngineResult<Option<Rc<RefCell<T>>>> {
        let lookup = self.cache.borrow().get::<T>(&row.key)?;
        match lookup {
            CacheLookup::Hit(entity) => Ok(Some(entity)),
            CacheLookup::Deleted => Ok(None),
            CacheLookup::Miss => {
                let entity = Rc::new(RefCell::new(T::from_row(row)?));
                self.cache.borrow_mut().put_persistent(entity.clone())?;
                Ok(Some(entity))
            }
        }
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&mut dyn StoreTransaction) -> Result<R, StoreError>,
    ) -> EngineResult<R> {
        self.transaction
            .with_transaction(f)
            .map_err(|e| self.services.classify(e))
    }

    fn apply(&self, op: &FlushOperation) -> EngineResult<()> {
        match op {
            FlushOperation::Insert(row) => self.read(|tx| tx.insert(row)),
            FlushOperation::Update {
                row,
                expected_revision,
            } => {
                let affected = self.read(|tx| tx.update(row, *expected_revision))?;
                if affected == 0 {
                    return Err(EngineError::optimistic_locking(format!(
                        "{} was updated by another transaction (expected revision {})",
                        row.key, expected_revision
                    )));
                }
                Ok(())
            }
            FlushOperation::Delete {
                key,
                expected_revision,
            } => {
                let affected = self.read(|tx| tx.delete(key, *expected_revision))?;
                if affected == 0 {
                    return Err(EngineError::optimistic_locking(format!(
                        "{key} was updated or deleted by another transaction (expected revision {expected_revision})"
                    )));
                }
                Ok(())
            }
        }
    }
}
