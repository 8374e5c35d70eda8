//! Persistable entities: identity, revision, and persistent-state snapshots.
//!
//! An entity is any row-backed object the entity cache can track. The cache
//! never looks at concrete fields; it works with three things:
//!
//! - the [`EntityKey`] (entity type + id) used as the identity-map key,
//! - the integer [`Revision`] guarding conditional writes,
//! - the [`DbEntity::persistent_state`] digest, compared by value at flush time
//!   to decide whether an update is needed.
//!
//! Concrete entities usually derive `Serialize`/`Deserialize`, keep `id` and
//! `revision` as `#[serde(skip)]` fields and implement both traits through
//! [`impl_db_entity!`](crate::impl_db_entity).

use core::any::Any;
use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::id::EntityId;

/// Optimistic-locking revision counter. New rows start at 1.
pub type Revision = i32;

/// Closed set of entity kinds the engine persists.
///
/// Resolved statically instead of through runtime type lookup; adding an entity
/// kind means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    ByteArray,
    Incident,
    VariableInstance,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Job,
        EntityType::ByteArray,
        EntityType::Incident,
        EntityType::VariableInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Job => "job",
            EntityType::ByteArray => "byte_array",
            EntityType::Incident => "incident",
            EntityType::VariableInstance => "variable_instance",
        }
    }

    pub fn parse(value: &str) -> EngineResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown entity type: {value}")))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity-map key: one cached instance per key per command context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Storage representation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub key: EntityKey,
    pub revision: Revision,
    pub data: Value,
}

/// Object-safe view of a persistable entity.
pub trait DbEntity: Any + fmt::Debug {
    fn entity_type(&self) -> EntityType;

    /// `None` until the entity manager assigns an id on insert.
    fn id(&self) -> Option<&EntityId>;

    fn set_id(&mut self, id: EntityId);

    fn revision(&self) -> Revision;

    fn set_revision(&mut self, revision: Revision);

    /// Structural digest of every persisted field.
    fn persistent_state(&self) -> EngineResult<Value>;

    /// Rows this entity points at. Referenced rows are inserted before and
    /// deleted after this one.
    fn referenced_entities(&self) -> Vec<EntityKey> {
        Vec::new()
    }

    fn key(&self) -> Option<EntityKey> {
        self.id()
            .map(|id| EntityKey::new(self.entity_type(), id.clone()))
    }
}

/// Typed entity that can be rebuilt from a stored row.
pub trait Entity: DbEntity + Sized {
    const TYPE: EntityType;

    fn from_row(row: &EntityRow) -> EngineResult<Self>;

    /// Row representation with the given revision.
    fn to_row(&self, revision: Revision) -> EngineResult<EntityRow> {
        let key = self.key().ok_or_else(|| {
            EngineError::invalid_argument(format!("{} entity has no id", Self::TYPE))
        })?;
        Ok(EntityRow {
            key,
            revision,
            data: self.persistent_state()?,
        })
    }
}

/// Implements [`DbEntity`] and [`Entity`] for a serde struct with
/// `id: Option<EntityId>` and `revision: Revision` fields.
///
/// ```ignore
/// impl_db_entity!(JobEntity, EntityType::Job, references = JobEntity::referenced_keys);
/// ```
#[macro_export]
macro_rules! impl_db_entity {
    ($ty:ty, $entity_type:expr) => {
        $crate::impl_db_entity!($ty, $entity_type, references = |_: &$ty| ::std::vec::Vec::new());
    };
    ($ty:ty, $entity_type:expr, references = $refs:expr) => {
        impl $crate::entity::DbEntity for $ty {
            fn entity_type(&self) -> $crate::entity::EntityType {
                $entity_type
            }

            fn id(&self) -> ::std::option::Option<&$crate::id::EntityId> {
                self.id.as_ref()
            }

            fn set_id(&mut self, id: $crate::id::EntityId) {
                self.id = ::std::option::Option::Some(id);
            }

            fn revision(&self) -> $crate::entity::Revision {
                self.revision
            }

            fn set_revision(&mut self, revision: $crate::entity::Revision) {
                self.revision = revision;
            }

            fn persistent_state(&self) -> $crate::error::EngineResult<$crate::serde_json::Value> {
                ::std::result::Result::Ok($crate::serde_json::to_value(self)?)
            }

            fn referenced_entities(&self) -> ::std::vec::Vec<$crate::entity::EntityKey> {
                let references: fn(&$ty) -> ::std::vec::Vec<$crate::entity::EntityKey> = $refs;
                references(self)
            }
        }

        impl $crate::entity::Entity for $ty {
            const TYPE: $crate::entity::EntityType = $entity_type;

            fn from_row(row: &$crate::entity::EntityRow) -> $crate::error::EngineResult<Self> {
                if row.key.entity_type != $entity_type {
                    return ::std::result::Result::Err($crate::error::EngineError::invalid_argument(
                        ::std::format!("row {} is not a {}", row.key, $entity_type),
                    ));
                }
                let mut entity: Self = $crate::serde_json::from_value(row.data.clone())?;
                entity.id = ::std::option::Option::Some(row.key.id.clone());
                entity.revision = row.revision;
                ::std::result::Result::Ok(entity)
            }
        }
    };
}
