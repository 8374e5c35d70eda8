//! Postgres-backed row store.
//!
//! All entities live in one table keyed by `(entity_type, id)`, with the
//! persistent state in a `jsonb` column. Guarded writes compare the `revision`
//! column, so concurrent engine instances coordinate through the database only.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any SQLSTATE) | `Database { code, .. }` |
//! | PoolClosed / Io / PoolTimedOut | `Connection` |
//! | ColumnDecode / Decode | `Decode` |
//! | Other | `Connection` |
//!
//! Retry decisions are left to the configured classifier.
//!
//! ## Threading
//!
//! The engine is synchronous. Queries are driven with `Handle::block_on` on a
//! runtime handle captured at construction, so store methods must be called
//! from plain threads (the engine's worker and acquisition threads), never from
//! inside an async task.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use flowforge_core::{EntityId, EntityKey, EntityRow, EntityType, Revision};

use super::r#trait::{AcquirableJobsQuery, Store, StoreError, StoreTransaction};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flowforge_entity (
    entity_type TEXT NOT NULL,
    id TEXT NOT NULL,
    revision INTEGER NOT NULL,
    data JSONB NOT NULL,
    PRIMARY KEY (entity_type, id)
)
"#;

const ACQUIRABLE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS flowforge_entity_job_due
    ON flowforge_entity (((data->>'due_date')::timestamptz))
    WHERE entity_type = 'job'
"#;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the entity table and the job due-date index if missing.
    #[instrument(skip(self), err)]
    pub fn migrate(&self) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(SCHEMA)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("create_table", e))?;
            sqlx::query(ACQUIRABLE_INDEX)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("create_index", e))?;
            Ok(())
        })
    }
}

impl Store for PostgresStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let pool = self.pool.clone();
        let tx = self
            .handle
            .block_on(async move { pool.begin().await })
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction {
            tx,
            handle: self.handle.clone(),
        }))
    }
}

pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
}

impl PostgresTransaction {
    fn fetch_rows(
        &mut self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let tx = &mut self.tx;
        let rows = self
            .handle
            .block_on(async { query.fetch_all(&mut **tx).await })
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_row).collect()
    }

    fn execute(
        &mut self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, StoreError> {
        let tx = &mut self.tx;
        let result = self
            .handle
            .block_on(async { query.execute(&mut **tx).await })
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }
}

impl StoreTransaction for PostgresTransaction {
    fn select_by_id(&mut self, key: &EntityKey) -> Result<Option<EntityRow>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT entity_type, id, revision, data
            FROM flowforge_entity
            WHERE entity_type = $1 AND id = $2
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.id.as_str());
        Ok(self.fetch_rows("select_by_id", query)?.into_iter().next())
    }

    fn select_by_type(&mut self, entity_type: EntityType) -> Result<Vec<EntityRow>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT entity_type, id, revision, data
            FROM flowforge_entity
            WHERE entity_type = $1
            ORDER BY id
            "#,
        )
        .bind(entity_type.as_str());
        self.fetch_rows("select_by_type", query)
    }

    fn select_by_field(
        &mut self,
        entity_type: EntityType,
        field: &str,
        value: &str,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT entity_type, id, revision, data
            FROM flowforge_entity
            WHERE entity_type = $1 AND data->>$2 = $3
            ORDER BY id
            "#,
        )
        .bind(entity_type.as_str())
        .bind(field.to_string())
        .bind(value.to_string());
        self.fetch_rows("select_by_field", query)
    }

    fn select_acquirable_jobs(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let sql = sqlx::query(
            r#"
            SELECT entity_type, id, revision, data
            FROM flowforge_entity
            WHERE entity_type = 'job'
              AND COALESCE((data->>'retries')::integer, 0) > 0
              AND COALESCE((data->>'suspended')::boolean, false) = false
              AND (data->>'due_date' IS NULL OR (data->>'due_date')::timestamptz <= $1)
              AND (
                data->>'lock_owner' IS NULL
                OR data->>'lock_expiration_time' IS NULL
                OR (data->>'lock_expiration_time')::timestamptz <= $1
              )
            ORDER BY COALESCE((data->>'priority')::bigint, 0) DESC,
                     (data->>'due_date')::timestamptz ASC NULLS FIRST,
                     id
            LIMIT $2
            "#,
        )
        .bind(query.now)
        .bind(limit);
        self.fetch_rows("select_acquirable_jobs", sql)
    }

    fn insert(&mut self, row: &EntityRow) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO flowforge_entity (entity_type, id, revision, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(row.key.entity_type.as_str())
        .bind(row.key.id.as_str().to_string())
        .bind(row.revision)
        .bind(row.data.clone());
        self.execute("insert", query).map(|_| ())
    }

    fn update(&mut self, row: &EntityRow, expected_revision: Revision) -> Result<u64, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE flowforge_entity
            SET revision = $3, data = $4
            WHERE entity_type = $1 AND id = $2 AND revision = $5
            "#,
        )
        .bind(row.key.entity_type.as_str())
        .bind(row.key.id.as_str().to_string())
        .bind(row.revision)
        .bind(row.data.clone())
        .bind(expected_revision);
        self.execute("update", query)
    }

    fn delete(&mut self, key: &EntityKey, expected_revision: Revision) -> Result<u64, StoreError> {
        let query = sqlx::query(
            r#"
            DELETE FROM flowforge_entity
            WHERE entity_type = $1 AND id = $2 AND revision = $3
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.id.as_str().to_string())
        .bind(expected_revision);
        self.execute("delete", query)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresTransaction { tx, handle } = *self;
        handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresTransaction { tx, handle } = *self;
        handle
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn decode_row(row: &PgRow) -> Result<EntityRow, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
    let entity_type: String = row.try_get("entity_type").map_err(decode)?;
    let id: String = row.try_get("id").map_err(decode)?;
    let revision: i32 = row.try_get("revision").map_err(decode)?;
    let data: serde_json::Value = row.try_get("data").map_err(decode)?;
    let entity_type =
        EntityType::parse(&entity_type).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(EntityRow {
        key: EntityKey::new(entity_type, EntityId::from(id)),
        revision,
        data,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database {
            code: db_err.code().map(|c| c.into_owned()),
            message: format!("{operation}: {}", db_err.message()),
            suppressed: Vec::new(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        other => StoreError::Connection(format!("{operation}: {other}")),
    }
}
