use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowforge_core::{EngineResult, EntityId, EntityType, Revision};

use crate::command::context::CommandContext;

/// Binary payload stored in its own row, referenced by id from other entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteArrayEntity {
    #[serde(skip)]
    id: Option<EntityId>,
    #[serde(skip)]
    revision: Revision,
    name: String,
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
}

flowforge_core::impl_db_entity!(ByteArrayEntity, EntityType::ByteArray);

impl ByteArrayEntity {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            revision: 0,
            name: name.into(),
            bytes,
            created_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

pub struct ByteArrayManager<'a> {
    ctx: &'a CommandContext,
}

impl<'a> ByteArrayManager<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> EngineResult<Rc<RefCell<ByteArrayEntity>>> {
        let entity = ByteArrayEntity::new(name, bytes, self.ctx.now());
        self.ctx.entity_manager().insert(entity)
    }

    pub fn find(&self, id: &EntityId) -> EngineResult<Option<Rc<RefCell<ByteArrayEntity>>>> {
        self.ctx.entity_manager().select_by_id(id)
    }

    /// Delete the row if it exists. Returns whether anything was deleted.
    pub fn delete(&self, id: &EntityId) -> EngineResult<bool> {
        match self.find(id)? {
            Some(entity) => {
                self.ctx.entity_manager().delete(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
