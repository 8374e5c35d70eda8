//! Entity persistence inside a command context.
//!
//! ```text
//! command ──► EntityManager ──► EntityCache (identity map, snapshots)
//!                 │                   │
//!                 │ reads             │ flush plan (insert → update → delete)
//!                 ▼                   ▼
//!            StoreTransaction ◄───────┘  guarded by revision
//! ```

pub mod byte_array;
pub mod cache;
pub mod entity_manager;
pub mod ordering;
pub mod value_field;

pub use byte_array::{ByteArrayEntity, ByteArrayManager};
pub use cache::{CacheLookup, EntityCache, EntityState, FlushOperation};
pub use entity_manager::{EntityManager, FlushOutcome};
pub use value_field::{ByteArrayField, TypedValueField};
