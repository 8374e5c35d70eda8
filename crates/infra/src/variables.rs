//! Variables: named JSON values stored through a deferred typed value field.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowforge_core::{EngineResult, EntityId, EntityKey, EntityType, Revision};

use crate::command::context::CommandContext;
use crate::db::value_field::TypedValueField;

#[derive(Debug, Serialize, Deserialize)]
pub struct VariableInstanceEntity {
    #[serde(skip)]
    id: Option<EntityId>,
    #[serde(skip)]
    revision: Revision,
    pub name: String,
    /// Owner of the variable (a job, an execution, any caller-defined scope).
    pub scope_id: String,
    pub value: TypedValueField,
    pub created_at: DateTime<Utc>,
}

flowforge_core::impl_db_entity!(
    VariableInstanceEntity,
    EntityType::VariableInstance,
    references = VariableInstanceEntity::value_key
);

impl VariableInstanceEntity {
    fn value_key(&self) -> Vec<EntityKey> {
        self.value.reference().into_iter().collect()
    }
}

pub struct VariableManager<'a> {
    ctx: &'a CommandContext,
}

impl<'a> VariableManager<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    /// Create a variable holding `value`. The value row is inserted before
    /// the variable at flush.
    pub fn create(
        &self,
        scope_id: &str,
        name: &str,
        value: Value,
    ) -> EngineResult<Rc<RefCell<VariableInstanceEntity>>> {
        let field = TypedValueField::default();
        field.set(value)?;
        self.ctx.entity_manager().insert(VariableInstanceEntity {
            id: None,
            revision: 0,
            name: name.to_string(),
            scope_id: scope_id.to_string(),
            value: field,
            created_at: self.ctx.now(),
        })
    }

    pub fn find_by_id(
        &self,
        id: &EntityId,
    ) -> EngineResult<Option<Rc<RefCell<VariableInstanceEntity>>>> {
        self.ctx.entity_manager().select_by_id(id)
    }

    pub fn find_by_scope(
        &self,
        scope_id: &str,
    ) -> EngineResult<Vec<Rc<RefCell<VariableInstanceEntity>>>> {
        self.ctx
            .entity_manager()
            .select_by_field("scope_id", scope_id, |v: &VariableInstanceEntity| {
                v.scope_id == scope_id
            })
    }

    pub fn find_by_name(
        &self,
        scope_id: &str,
        name: &str,
    ) -> EngineResult<Option<Rc<RefCell<VariableInstanceEntity>>>> {
        Ok(self
            .find_by_scope(scope_id)?
            .into_iter()
            .find(|v| v.borrow().name == name))
    }

    /// Delete the variable together with its value row.
    pub fn delete(&self, variable: &Rc<RefCell<VariableInstanceEntity>>) -> EngineResult<()> {
        variable.borrow().value.delete()?;
        self.ctx.entity_manager().delete(variable)
    }
}
