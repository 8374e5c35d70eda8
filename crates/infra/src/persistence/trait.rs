use chrono::{DateTime, Utc};
use thiserror::Error;

use flowforge_core::{EntityKey, EntityRow, EntityType, Revision};

/// Store operation error.
///
/// These are **infrastructure errors** as reported by the backend. Whether a
/// failure is a retryable serialization conflict is decided later by a
/// [`ConflictClassifier`](super::ConflictClassifier), never here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Error reported by the database, with its SQLSTATE when known.
    ///
    /// `suppressed` holds secondary failures raised while handling this one
    /// (for example a rollback that also failed after a commit error).
    #[error("database error{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Database {
        code: Option<String>,
        message: String,
        suppressed: Vec<StoreError>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    /// A stored row could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already closed")]
    TransactionClosed,
}

impl StoreError {
    pub fn database(code: Option<&str>, message: impl Into<String>) -> Self {
        StoreError::Database {
            code: code.map(str::to_string),
            message: message.into(),
            suppressed: Vec::new(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn suppressed(&self) -> &[StoreError] {
        match self {
            StoreError::Database { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Attach a secondary failure.
    pub fn with_suppressed(self, other: StoreError) -> Self {
        match self {
            StoreError::Database {
                code,
                message,
                mut suppressed,
            } => {
                suppressed.push(other);
                StoreError::Database {
                    code,
                    message,
                    suppressed,
                }
            }
            primary => StoreError::Database {
                code: None,
                message: primary.to_string(),
                suppressed: vec![other],
            },
        }
    }
}

/// Filter of the job acquisition query.
///
/// Matches jobs that are due (`due_date` null or `<= now`), not suspended,
/// have retries left, and are unlocked or whose lock expired. Results are
/// ordered by priority descending (missing priority counts as 0), then due
/// date ascending, nulls first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquirableJobsQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Transactional row store.
///
/// Implementations must be `Send + Sync` so one store can back every thread of
/// an engine instance, and several engine instances may share the same backend.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One open store transaction.
///
/// Guarded writes (`update`, `delete`) return the number of affected rows; a
/// zero means the expected revision no longer matches (or the row is gone) and
/// is reported to the caller rather than raised here.
pub trait StoreTransaction {
    fn select_by_id(&mut self, key: &EntityKey) -> Result<Option<EntityRow>, StoreError>;

    fn select_by_type(&mut self, entity_type: EntityType) -> Result<Vec<EntityRow>, StoreError>;

    /// Rows whose top-level JSON string field `field` equals `value`.
    fn select_by_field(
        &mut self,
        entity_type: EntityType,
        field: &str,
        value: &str,
    ) -> Result<Vec<EntityRow>, StoreError>;

    fn select_acquirable_jobs(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<Vec<EntityRow>, StoreError>;

    fn insert(&mut self, row: &EntityRow) -> Result<(), StoreError>;

    /// Overwrite `row.key` with `row` where the stored revision equals `expected_revision`.
    fn update(&mut self, row: &EntityRow, expected_revision: Revision) -> Result<u64, StoreError>;

    fn delete(&mut self, key: &EntityKey, expected_revision: Revision) -> Result<u64, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
