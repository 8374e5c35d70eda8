//! Deferred value fields.
//!
//! A field stores only the id of a separate byte-array row. The row is loaded
//! through the thread's current command context on first read and kept for the
//! rest of that context. Both field types serialize as the bare id (or `null`),
//! so the owning entity's persistent state changes only when the reference
//! changes.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use flowforge_core::{DbEntity, EngineError, EngineResult, EntityId, EntityKey, EntityType};

use crate::command::context::{self, CommandContext, CommandContextListener};

use super::byte_array::ByteArrayEntity;

const TYPED_VALUE_NAME: &str = "typed-value";

/// Lazily loaded reference to a byte-array row.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteArrayField {
    id: Option<EntityId>,
    #[serde(skip)]
    loaded: RefCell<Option<Rc<RefCell<ByteArrayEntity>>>>,
}

impl ByteArrayField {
    pub fn id(&self) -> Option<&EntityId> {
        self.id.as_ref()
    }

    pub fn reference(&self) -> Option<EntityKey> {
        self.id
            .as_ref()
            .map(|id| EntityKey::new(EntityType::ByteArray, id.clone()))
    }

    /// Current bytes, `None` when nothing is referenced.
    pub fn get_bytes(&self) -> EngineResult<Option<Vec<u8>>> {
        if self.id.is_none() {
            return Ok(None);
        }
        let ctx = context::require_current("read deferred byte array")?;
        let entity = self.load(&ctx)?;
        let bytes = entity.borrow().bytes().to_vec();
        Ok(Some(bytes))
    }

    /// Replace the bytes, updating the referenced row in place or inserting a
    /// new one.
    pub fn set_bytes(&mut self, name: &str, bytes: Vec<u8>) -> EngineResult<()> {
        let ctx = context::require_current("write deferred byte array")?;
        if self.id.is_some() {
            let entity = self.load(&ctx)?;
            entity.borrow_mut().set_bytes(bytes);
            return Ok(());
        }

        let entity = ctx.byte_array_manager().create(name, bytes)?;
        self.id = entity.borrow().id().cloned();
        *self.loaded.borrow_mut() = Some(entity);
        Ok(())
    }

    /// Delete the referenced row and clear the reference.
    pub fn delete(&mut self) -> EngineResult<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        self.loaded.borrow_mut().take();
        let ctx = context::require_current("delete deferred byte array")?;
        ctx.byte_array_manager().delete(&id)?;
        Ok(())
    }

    fn load(&self, ctx: &CommandContext) -> EngineResult<Rc<RefCell<ByteArrayEntity>>> {
        if let Some(entity) = self.loaded.borrow().as_ref() {
            return Ok(entity.clone());
        }
        let id = self
            .id
            .as_ref()
            .ok_or_else(|| EngineError::invalid_argument("byte array field is empty"))?;
        let entity = ctx
            .byte_array_manager()
            .find(id)?
            .ok_or_else(|| EngineError::MissingReference(format!("byte array {id}")))?;
        *self.loaded.borrow_mut() = Some(entity.clone());
        Ok(entity)
    }
}

#[derive(Debug, Default)]
struct TypedValueState {
    bytes: ByteArrayField,
    value: Option<Value>,
    dirty: bool,
    listener_registered: bool,
}

/// JSON value stored in a byte-array row.
///
/// [`TypedValueField::get`] returns a copy; changes to it are not persisted.
/// Mutate through [`TypedValueField::update`] instead: it marks the field
/// dirty, and the value is written back when the command context closes,
/// unless the serialized bytes turn out identical to the stored ones.
#[derive(Clone, Default)]
pub struct TypedValueField {
    state: Rc<RefCell<TypedValueState>>,
}

impl std::fmt::Debug for TypedValueField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TypedValueField")
            .field("id", &state.bytes.id)
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl TypedValueField {
    pub fn id(&self) -> Option<EntityId> {
        self.state.borrow().bytes.id.clone()
    }

    pub fn reference(&self) -> Option<EntityKey> {
        self.state.borrow().bytes.reference()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    pub fn get(&self) -> EngineResult<Option<Value>> {
        self.ensure_loaded()?;
        Ok(self.state.borrow().value.clone())
    }

    /// Store `value` now.
    pub fn set(&self, value: Value) -> EngineResult<()> {
        let bytes = serde_json::to_vec(&value)?;
        let mut state = self.state.borrow_mut();
        state.bytes.set_bytes(TYPED_VALUE_NAME, bytes)?;
        state.value = Some(value);
        state.dirty = false;
        Ok(())
    }

    /// Mutate the value in place; a missing value starts as `null`.
    pub fn update(&self, f: impl FnOnce(&mut Value)) -> EngineResult<()> {
        let ctx = context::require_current("update typed value")?;
        self.ensure_loaded()?;

        let register = {
            let mut state = self.state.borrow_mut();
            f(state.value.get_or_insert(Value::Null));
            state.dirty = true;
            !std::mem::replace(&mut state.listener_registered, true)
        };
        if register {
            ctx.add_listener(Rc::new(DirtyValueWriter {
                state: self.state.clone(),
            }));
        }
        Ok(())
    }

    pub fn delete(&self) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        state.bytes.delete()?;
        state.value = None;
        state.dirty = false;
        Ok(())
    }

    fn ensure_loaded(&self) -> EngineResult<()> {
        let bytes = {
            let state = self.state.borrow();
            if state.value.is_some() {
                return Ok(());
            }
            state.bytes.get_bytes()?
        };
        if let Some(bytes) = bytes {
            let value: Value = serde_json::from_slice(&bytes)?;
            self.state.borrow_mut().value = Some(value);
        }
        Ok(())
    }
}

impl Serialize for TypedValueField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.state.borrow().bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TypedValueField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = ByteArrayField::deserialize(deserializer)?;
        Ok(Self {
            state: Rc::new(RefCell::new(TypedValueState {
                bytes,
                ..TypedValueState::default()
            })),
        })
    }
}

/// Close listener writing back a value mutated through [`TypedValueField::update`].
struct DirtyValueWriter {
    state: Rc<RefCell<TypedValueState>>,
}

impl CommandContextListener for DirtyValueWriter {
    fn on_close(&self, _ctx: &CommandContext) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        state.listener_registered = false;
        if !std::mem::replace(&mut state.dirty, false) {
            return Ok(());
        }
        let value = state.value.clone().unwrap_or(Value::Null);
        let bytes = serde_json::to_vec(&value)?;
        if state.bytes.get_bytes()?.as_deref() == Some(bytes.as_slice()) {
            return Ok(());
        }
        state.bytes.set_bytes(TYPED_VALUE_NAME, bytes)
    }
}
