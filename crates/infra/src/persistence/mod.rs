//! Transactional row store boundary.
//!
//! The engine needs very little from its database: row reads inside a
//! transaction, revision-guarded updates and deletes, the job acquisition
//! query, and commit/rollback. This module defines that boundary and two
//! implementations (in-memory for tests/dev, Postgres for production) plus the
//! classifier that recognises retryable serialization conflicts.

pub mod classifier;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use classifier::{ConflictClassifier, SqlStateClassifier};
pub use in_memory::{InMemoryStore, StoreStats};
pub use postgres::PostgresStore;
pub use r#trait::{AcquirableJobsQuery, Store, StoreError, StoreTransaction};
