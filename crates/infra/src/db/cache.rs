//! Per-context identity map with dirty tracking.
//!
//! Every entity loaded or created inside one command context is held here
//! exactly once, keyed by [`EntityKey`]. Callers get `Rc<RefCell<T>>` handles,
//! so two lookups of the same key observe the same instance and its mutations.
//!
//! At flush the cache turns its entries into an ordered list of
//! [`FlushOperation`]s:
//!
//! 1. inserts of new entities, referenced rows first, otherwise creation order;
//! 2. updates of loaded entities whose persistent state differs from the
//!    snapshot taken at load (or at the previous flush);
//! 3. deletes, in reverse dependency order. A deleted entity still depends
//!    on the rows its stored state referenced, even when the reference was
//!    cleared in memory before the delete.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use flowforge_core::{DbEntity, EngineError, EngineResult, Entity, EntityKey, EntityRow, Revision};

use super::ordering::{topological_order, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created in this context, not yet written.
    Transient,
    /// Loaded from (or already flushed to) the store.
    Persistent,
    /// Created and deleted in this context; never written.
    DeletedTransient,
    /// Loaded, then deleted; a guarded delete is pending.
    DeletedPersistent,
}

impl EntityState {
    pub fn is_deleted(&self) -> bool {
        matches!(self, EntityState::DeletedTransient | EntityState::DeletedPersistent)
    }
}

struct CachedEntity {
    entity: Rc<RefCell<dyn DbEntity>>,
    typed: Rc<dyn Any>,
    state: EntityState,
    snapshot: Option<Value>,
    /// References of the stored row, as of load or the last flush.
    stored_references: Vec<EntityKey>,
    sequence: u64,
}

/// Outcome of a cache lookup.
pub enum CacheLookup<T> {
    Hit(Rc<RefCell<T>>),
    /// The entity was deleted in this context; callers must not reload it.
    Deleted,
    Miss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOperation {
    Insert(EntityRow),
    Update {
        row: EntityRow,
        expected_revision: Revision,
    },
    Delete {
        key: EntityKey,
        expected_revision: Revision,
    },
}

impl FlushOperation {
    pub fn key(&self) -> &EntityKey {
        match self {
            FlushOperation::Insert(row) => &row.key,
            FlushOperation::Update { row, .. } => &row.key,
            FlushOperation::Delete { key, .. } => key,
        }
    }
}

#[derive(Default)]
pub struct EntityCache {
    entries: HashMap<EntityKey, CachedEntity>,
    next_sequence: u64,
}

fn borrow_entity(entity: &RefCell<dyn DbEntity>) -> EngineResult<std::cell::Ref<'_, dyn DbEntity>> {
    entity
        .try_borrow()
        .map_err(|_| EngineError::command("entity is mutably borrowed during flush"))
}

fn key_of(entity: &dyn DbEntity) -> EngineResult<EntityKey> {
    entity
        .key()
        .ok_or_else(|| EngineError::invalid_argument(format!("{} entity has no id", entity.entity_type())))
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an entity created in this context.
    pub fn put_transient<T: Entity>(&mut self, entity: Rc<RefCell<T>>) -> EngineResult<()> {
        self.put(entity, EntityState::Transient)
    }

    /// Register an entity loaded from the store and snapshot its state.
    pub fn put_persistent<T: Entity>(&mut self, entity: Rc<RefCell<T>>) -> EngineResult<()> {
        self.put(entity, EntityState::Persistent)
    }

    fn put<T: Entity>(&mut self, entity: Rc<RefCell<T>>, state: EntityState) -> EngineResult<()> {
        let (key, snapshot, stored_references) = {
            let borrowed = entity.borrow();
            let key = key_of(&*borrowed)?;
            match state {
                EntityState::Persistent => (
                    key,
                    Some(borrowed.persistent_state()?),
                    borrowed.referenced_entities(),
                ),
                _ => (key, None, Vec::new()),
            }
        };
        if self.entries.contains_key(&key) {
            return Err(EngineError::invalid_argument(format!(
                "entity {key} is already cached"
            )));
        }

        self.next_sequence += 1;
        let typed: Rc<dyn Any> = entity.clone();
        let erased: Rc<RefCell<dyn DbEntity>> = entity;
        self.entries.insert(
            key,
            CachedEntity {
                entity: erased,
                typed,
                state,
                snapshot,
                stored_references,
                sequence: self.next_sequence,
            },
        );
        Ok(())
    }

    pub fn get<T: Entity>(&self, key: &EntityKey) -> EngineResult<CacheLookup<T>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(CacheLookup::Miss);
        };
        if entry.state.is_deleted() {
            return Ok(CacheLookup::Deleted);
        }
        entry
            .typed
            .clone()
            .downcast::<RefCell<T>>()
            .map(CacheLookup::Hit)
            .map_err(|_| EngineError::invalid_argument(format!("cached entity {key} has a different type")))
    }

    pub fn state(&self, key: &EntityKey) -> Option<EntityState> {
        self.entries.get(key).map(|e| e.state)
    }

    /// Live (not deleted) entries of type `T`, in creation/load order.
    pub fn entities_of<T: Entity>(&self) -> Vec<Rc<RefCell<T>>> {
        let mut found: Vec<(u64, Rc<RefCell<T>>)> = self
            .entries
            .iter()
            .filter(|(key, entry)| key.entity_type == T::TYPE && !entry.state.is_deleted())
            .filter_map(|(_, entry)| {
                entry
                    .typed
                    .clone()
                    .downcast::<RefCell<T>>()
                    .ok()
                    .map(|rc| (entry.sequence, rc))
            })
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, rc)| rc).collect()
    }

    pub fn mark_deleted(&mut self, key: &EntityKey) -> EngineResult<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::invalid_argument(format!("entity {key} is not cached")))?;
        entry.state = match entry.state {
            EntityState::Transient => EntityState::DeletedTransient,
            EntityState::Persistent => EntityState::DeletedPersistent,
            deleted => deleted,
        };
        Ok(())
    }

    /// Forget an entry entirely; the next lookup goes back to the store.
    pub fn evict(&mut self, key: &EntityKey) {
        self.entries.remove(key);
    }

    /// Persistent-state change check for one loaded entity.
    ///
    /// Returns the row to write when the state differs from the snapshot.
    pub fn pending_update(&self, key: &EntityKey) -> EngineResult<Option<FlushOperation>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.state != EntityState::Persistent {
            return Ok(None);
        }
        let entity = borrow_entity(&entry.entity)?;
        let current = entity.persistent_state()?;
        if entry.snapshot.as_ref() == Some(&current) {
            return Ok(None);
        }
        let expected_revision = entity.revision();
        Ok(Some(FlushOperation::Update {
            row: EntityRow {
                key: key.clone(),
                revision: expected_revision + 1,
                data: current,
            },
            expected_revision,
        }))
    }

    /// Ordered write plan for everything this context changed.
    pub fn flush_plan(&self) -> EngineResult<Vec<FlushOperation>> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for (key, entry) in &self.entries {
            match entry.state {
                EntityState::Transient => {
                    let entity = borrow_entity(&entry.entity)?;
                    let row = EntityRow {
                        key: key.clone(),
                        revision: entity.revision(),
                        data: entity.persistent_state()?,
                    };
                    let node = Node {
                        key: key.clone(),
                        rank: entry.sequence,
                        depends_on: entity.referenced_entities(),
                    };
                    inserts.push((node, row));
                }
                EntityState::Persistent => {
                    if let Some(op) = self.pending_update(key)? {
                        updates.push((entry.sequence, op));
                    }
                }
                EntityState::DeletedPersistent => {
                    let entity = borrow_entity(&entry.entity)?;
                    let mut depends_on = entity.referenced_entities();
                    depends_on.extend(entry.stored_references.iter().cloned());
                    let node = Node {
                        key: key.clone(),
                        rank: entry.sequence,
                        depends_on,
                    };
                    deletes.push((node, entity.revision()));
                }
                EntityState::DeletedTransient => {}
            }
        }

        let mut plan = Vec::with_capacity(inserts.len() + updates.len() + deletes.len());

        let mut insert_rows: HashMap<EntityKey, EntityRow> = inserts
            .iter()
            .map(|(node, row)| (node.key.clone(), row.clone()))
            .collect();
        for key in topological_order(inserts.into_iter().map(|(node, _)| node).collect()) {
            if let Some(row) = insert_rows.remove(&key) {
                plan.push(FlushOperation::Insert(row));
            }
        }

        updates.sort_by_key(|(seq, _)| *seq);
        plan.extend(updates.into_iter().map(|(_, op)| op));

        let revisions: HashMap<EntityKey, Revision> = deletes
            .iter()
            .map(|(node, rev)| (node.key.clone(), *rev))
            .collect();
        let mut delete_order = topological_order(deletes.into_iter().map(|(node, _)| node).collect());
        delete_order.reverse();
        for key in delete_order {
            if let Some(&expected_revision) = revisions.get(&key) {
                plan.push(FlushOperation::Delete {
                    key,
                    expected_revision,
                });
            }
        }

        Ok(plan)
    }

    /// Record that `op` reached the store.
    pub fn mark_flushed(&mut self, op: &FlushOperation) -> EngineResult<()> {
        match op {
            FlushOperation::Insert(row) => {
                if let Some(entry) = self.entries.get_mut(&row.key) {
                    entry.stored_references = borrow_entity(&entry.entity)?.referenced_entities();
                    entry.state = EntityState::Persistent;
                    entry.snapshot = Some(row.data.clone());
                }
            }
            FlushOperation::Update { row, .. } => {
                if let Some(entry) = self.entries.get_mut(&row.key) {
                    let mut entity = entry
                        .entity
                        .try_borrow_mut()
                        .map_err(|_| EngineError::command("entity is borrowed during flush"))?;
                    entity.set_revision(row.revision);
                    entry.stored_references = entity.referenced_entities();
                    drop(entity);
                    entry.snapshot = Some(row.data.clone());
                }
            }
            FlushOperation::Delete { key, .. } => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}
