//! Entity identifiers and id generation.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Opaque, store-unique identifier of a persisted entity.
///
/// Ids are plain strings so that rows created by other engine instances (or by
/// hand) round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for EntityId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(EngineError::invalid_argument("entity id must not be empty"));
        }
        Ok(Self(s.to_string()))
    }
}

/// Source of fresh entity ids, resolved once at engine build time.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> EntityId;
}

/// Time-ordered UUIDv7 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7IdGenerator;

impl IdGenerator for UuidV7IdGenerator {
    fn next_id(&self) -> EntityId {
        EntityId::from(Uuid::now_v7())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_are_unique() {
        let generator = UuidV7IdGenerator;
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn parse_rejects_blank_ids() {
        assert!("  ".parse::<EntityId>().is_err());
        assert_eq!("J1".parse::<EntityId>().unwrap().as_str(), "J1");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = EntityId::from("J1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"J1\"");
    }
}
