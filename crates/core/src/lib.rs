//! `flowforge-core` — engine foundation building blocks.
//!
//! Pure primitives shared by the command pipeline and the job executor:
//! identifiers, the error model, entity traits and the clock. No IO lives here.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{DbEntity, Entity, EntityKey, EntityRow, EntityType, Revision};
pub use error::{EngineError, EngineResult};
pub use id::{EntityId, IdGenerator, UuidV7IdGenerator};

#[doc(hidden)]
pub use serde_json;
