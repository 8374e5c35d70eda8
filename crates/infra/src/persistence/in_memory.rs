use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use flowforge_core::{EntityKey, EntityRow, EntityType, Revision};

use super::r#trait::{AcquirableJobsQuery, Store, StoreError, StoreTransaction};

type TxnId = u64;

/// Uncommitted write owned by one transaction. `row: None` is a delete.
#[derive(Debug, Clone)]
struct PendingWrite {
    txn: TxnId,
    row: Option<EntityRow>,
}

#[derive(Debug, Clone, Default)]
struct RowSlot {
    committed: Option<EntityRow>,
    pending: Option<PendingWrite>,
}

impl RowSlot {
    fn visible_to(&self, txn: TxnId) -> Option<&EntityRow> {
        match &self.pending {
            Some(p) if p.txn == txn => p.row.as_ref(),
            _ => self.committed.as_ref(),
        }
    }

    fn locked_by_other(&self, txn: TxnId) -> bool {
        matches!(&self.pending, Some(p) if p.txn != txn)
    }
}

/// Counters of applied operations, for assertions in tests and benchmarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub conflicts: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    rows: BTreeMap<EntityKey, RowSlot>,
    next_txn: TxnId,
    commit_failures: VecDeque<StoreError>,
    stats: StoreStats,
}

impl StoreState {
    fn discard(&mut self, txn: TxnId) {
        self.rows.retain(|_, slot| {
            if matches!(&slot.pending, Some(p) if p.txn == txn) {
                slot.pending = None;
            }
            slot.committed.is_some() || slot.pending.is_some()
        });
    }

    fn apply(&mut self, txn: TxnId) {
        self.rows.retain(|_, slot| {
            if matches!(&slot.pending, Some(p) if p.txn == txn) {
                if let Some(pending) = slot.pending.take() {
                    slot.committed = pending.row;
                }
            }
            slot.committed.is_some() || slot.pending.is_some()
        });
    }
}

/// In-memory transactional row store.
///
/// Intended for tests/dev. It models the row-level behaviour the engine relies
/// on from a relational store:
///
/// - **Read committed**: a transaction sees committed rows plus its own writes.
/// - **Row write locks**: a written row stays locked by its transaction until
///   commit or rollback. A guarded write from another transaction against a
///   locked row affects zero rows instead of blocking.
/// - **Guarded writes**: `update`/`delete` only apply when the visible revision
///   matches the expected one.
///
/// Serialization failures at commit can be injected with [`fail_next_commits`](Self::fail_next_commits).
/// Cloning shares the underlying state, so several engine instances can run
/// against one store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `error`. Failed commits discard
    /// their writes like a rollback.
    pub fn fail_next_commits(&self, count: usize, error: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state
                .commit_failures
                .extend(std::iter::repeat(error).take(count));
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    /// Committed row, bypassing any transaction.
    pub fn committed(&self, key: &EntityKey) -> Option<EntityRow> {
        let state = self.state.lock().ok()?;
        state.rows.get(key).and_then(|s| s.committed.clone())
    }

    /// Number of committed rows of a type.
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.rows
                    .values()
                    .filter_map(|slot| slot.committed.as_ref())
                    .filter(|row| row.key.entity_type == entity_type)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let txn = {
            let mut state = lock(&self.state)?;
            state.next_txn += 1;
            state.next_txn
        };
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            txn,
            finished: false,
        }))
    }
}

fn lock(state: &Mutex<StoreState>) -> Result<MutexGuard<'_, StoreState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Connection("store lock poisoned".to_string()))
}

/// Transaction handle of [`InMemoryStore`]. Dropping it without commit rolls back.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    txn: TxnId,
    finished: bool,
}

impl InMemoryTransaction {
    fn visible_rows<F>(&self, mut filter: F) -> Result<Vec<EntityRow>, StoreError>
    where
        F: FnMut(&EntityRow) -> bool,
    {
        self.ensure_open()?;
        let state = lock(&self.state)?;
        Ok(state
            .rows
            .values()
            .filter_map(|slot| slot.visible_to(self.txn))
            .filter(|row| filter(row))
            .cloned()
            .collect())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    fn guarded_write(
        &mut self,
        key: &EntityKey,
        expected_revision: Revision,
        row: Option<EntityRow>,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let txn = self.txn;
        let mut state = lock(&self.state)?;
        let applied = match state.rows.get_mut(key) {
            Some(slot) if !slot.locked_by_other(txn) => {
                let matches = slot
                    .visible_to(txn)
                    .is_some_and(|current| current.revision == expected_revision);
                if matches {
                    slot.pending = Some(PendingWrite { txn, row });
                }
                matches
            }
            _ => false,
        };
        if !applied {
            state.stats.conflicts += 1;
        }
        Ok(u64::from(applied))
    }
}

#[derive(Debug, Deserialize)]
struct AcquisitionFields {
    due_date: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    lock_expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    retries: i32,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    suspended: bool,
}

impl AcquisitionFields {
    fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        let due = self.due_date.is_none_or(|d| d <= now);
        let unlocked = self.lock_owner.is_none()
            || self.lock_expiration_time.is_none_or(|e| e <= now);
        due && unlocked && self.retries > 0 && !self.suspended
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn select_by_id(&mut self, key: &EntityKey) -> Result<Option<EntityRow>, StoreError> {
        self.ensure_open()?;
        let state = lock(&self.state)?;
        Ok(state
            .rows
            .get(key)
            .and_then(|slot| slot.visible_to(self.txn))
            .cloned())
    }

    fn select_by_type(&mut self, entity_type: EntityType) -> Result<Vec<EntityRow>, StoreError> {
        self.visible_rows(|row| row.key.entity_type == entity_type)
    }

    fn select_by_field(
        &mut self,
        entity_type: EntityType,
        field: &str,
        value: &str,
    ) -> Result<Vec<EntityRow>, StoreError> {
        self.visible_rows(|row| {
            row.key.entity_type == entity_type
                && row.data.get(field).and_then(|v| v.as_str()) == Some(value)
        })
    }

    fn select_acquirable_jobs(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let mut candidates = Vec::new();
        for row in self.visible_rows(|row| row.key.entity_type == EntityType::Job)? {
            let fields: AcquisitionFields = serde_json::from_value(row.data.clone())
                .map_err(|e| StoreError::Decode(format!("job {}: {e}", row.key.id)))?;
            if fields.is_acquirable(query.now) {
                candidates.push(((Reverse(fields.priority), fields.due_date), row));
            }
        }
        // Option orders None first, which puts jobs without a due date at the front.
        candidates.sort_by(|(a, ra), (b, rb)| a.cmp(b).then_with(|| ra.key.cmp(&rb.key)));
        Ok(candidates
            .into_iter()
            .take(query.limit)
            .map(|(_, row)| row)
            .collect())
    }

    fn insert(&mut self, row: &EntityRow) -> Result<(), StoreError> {
        self.ensure_open()?;
        let txn = self.txn;
        let mut state = lock(&self.state)?;
        let slot = state.rows.entry(row.key.clone()).or_default();
        if slot.locked_by_other(txn) || slot.visible_to(txn).is_some() {
            return Err(StoreError::database(
                Some("23505"),
                format!("duplicate key {}", row.key),
            ));
        }
        slot.pending = Some(PendingWrite {
            txn,
            row: Some(row.clone()),
        });
        state.stats.inserts += 1;
        Ok(())
    }

    fn update(&mut self, row: &EntityRow, expected_revision: Revision) -> Result<u64, StoreError> {
        let affected = self.guarded_write(&row.key, expected_revision, Some(row.clone()))?;
        if affected > 0 {
            lock(&self.state)?.stats.updates += 1;
        }
        Ok(affected)
    }

    fn delete(&mut self, key: &EntityKey, expected_revision: Revision) -> Result<u64, StoreError> {
        let affected = self.guarded_write(key, expected_revision, None)?;
        if affected > 0 {
            lock(&self.state)?.stats.deletes += 1;
        }
        Ok(affected)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        let mut state = lock(&self.state)?;
        if let Some(error) = state.commit_failures.pop_front() {
            state.discard(self.txn);
            state.stats.rollbacks += 1;
            return Err(error);
        }
        state.apply(self.txn);
        state.stats.commits += 1;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        let mut state = lock(&self.state)?;
        state.discard(self.txn);
        state.stats.rollbacks += 1;
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.discard(self.txn);
            state.stats.rollbacks += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_row(id: &str, revision: Revision, data: serde_json::Value) -> EntityRow {
        EntityRow {
            key: EntityKey::new(EntityType::Job, id),
            revision,
            data,
        }
    }

    fn due_job(id: &str, due: Option<&str>) -> EntityRow {
        job_row(
            id,
            1,
            json!({
                "handler_type": "noop",
                "due_date": due,
                "lock_owner": null,
                "lock_expiration_time": null,
                "retries": 3,
                "suspended": false,
            }),
        )
    }

    fn seed(store: &InMemoryStore, rows: &[EntityRow]) {
        let mut tx = store.begin().unwrap();
        for row in rows {
            tx.insert(row).unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let store = InMemoryStore::new();
        let row = job_row("j1", 1, json!({"a": 1}));

        let mut writer = store.begin().unwrap();
        writer.insert(&row).unwrap();
        assert_eq!(writer.select_by_id(&row.key).unwrap(), Some(row.clone()));

        let mut reader = store.begin().unwrap();
        assert_eq!(reader.select_by_id(&row.key).unwrap(), None);

        writer.commit().unwrap();
        assert_eq!(reader.select_by_id(&row.key).unwrap(), Some(row));
    }

    #[test]
    fn stale_revision_affects_zero_rows() {
        let store = InMemoryStore::new();
        let row = job_row("j1", 1, json!({"a": 1}));
        seed(&store, &[row.clone()]);

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();

        let mut next = row.clone();
        next.revision = 2;
        next.data = json!({"a": 2});
        assert_eq!(first.update(&next, 1).unwrap(), 1);
        // Row is write-locked by `first`.
        assert_eq!(second.update(&next, 1).unwrap(), 0);
        first.commit().unwrap();

        // After commit the revision moved on.
        assert_eq!(second.update(&next, 1).unwrap(), 0);
        assert_eq!(second.delete(&row.key, 1).unwrap(), 0);
        assert_eq!(second.delete(&row.key, 2).unwrap(), 1);
        second.commit().unwrap();

        assert!(store.committed(&row.key).is_none());
        assert_eq!(store.stats().conflicts, 3);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.insert(&job_row("j1", 1, json!({}))).unwrap();
        }
        assert_eq!(store.count(EntityType::Job), 0);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn duplicate_insert_is_a_unique_violation() {
        let store = InMemoryStore::new();
        let row = job_row("j1", 1, json!({}));
        seed(&store, &[row.clone()]);

        let mut tx = store.begin().unwrap();
        let err = tx.insert(&row).unwrap_err();
        assert_eq!(err.code(), Some("23505"));
    }

    #[test]
    fn injected_commit_failure_discards_writes() {
        let store = InMemoryStore::new();
        store.fail_next_commits(1, StoreError::database(Some("40001"), "restart transaction"));

        let mut tx = store.begin().unwrap();
        tx.insert(&job_row("j1", 1, json!({}))).unwrap();
        let err = tx.commit().unwrap_err();
        assert_eq!(err.code(), Some("40001"));
        assert_eq!(store.count(EntityType::Job), 0);

        let mut tx = store.begin().unwrap();
        tx.insert(&job_row("j1", 1, json!({}))).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.count(EntityType::Job), 1);
    }

    #[test]
    fn closed_transaction_rejects_reuse() {
        let store = InMemoryStore::new();
        let mut tx = InMemoryTransaction {
            state: store.state.clone(),
            txn: 99,
            finished: true,
        };
        assert_eq!(
            tx.select_by_type(EntityType::Job).unwrap_err(),
            StoreError::TransactionClosed
        );
    }

    #[test]
    fn acquirable_jobs_are_due_unlocked_and_ordered() {
        let store = InMemoryStore::new();
        let mut locked = due_job("locked", None);
        locked.data["lock_owner"] = json!("node-b");
        locked.data["lock_expiration_time"] = json!("2030-01-01T00:00:00Z");
        let mut expired = due_job("expired", Some("2024-01-01T00:00:02Z"));
        expired.data["lock_owner"] = json!("node-b");
        expired.data["lock_expiration_time"] = json!("2024-01-01T00:00:00Z");
        let mut exhausted = due_job("exhausted", None);
        exhausted.data["retries"] = json!(0);
        let mut suspended = due_job("suspended", None);
        suspended.data["suspended"] = json!(true);

        seed(
            &store,
            &[
                due_job("late", Some("2024-01-01T00:00:05Z")),
                due_job("early", Some("2024-01-01T00:00:01Z")),
                due_job("now", None),
                due_job("future", Some("2030-01-01T00:00:00Z")),
                locked,
                expired,
                exhausted,
                suspended,
            ],
        );

        let mut tx = store.begin().unwrap();
        let query = AcquirableJobsQuery {
            now: "2024-06-01T00:00:00Z".parse().unwrap(),
            limit: 10,
        };
        let ids: Vec<String> = tx
            .select_acquirable_jobs(&query)
            .unwrap()
            .into_iter()
            .map(|r| r.key.id.into_string())
            .collect();
        assert_eq!(ids, vec!["now", "early", "expired", "late"]);

        let limited = tx
            .select_acquirable_jobs(&AcquirableJobsQuery { limit: 2, ..query })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn acquirable_jobs_prefer_higher_priority() {
        let store = InMemoryStore::new();
        let mut urgent = due_job("urgent", Some("2024-01-01T00:00:09Z"));
        urgent.data["priority"] = json!(10);
        let mut low = due_job("low", None);
        low.data["priority"] = json!(-5);
        seed(
            &store,
            &[
                due_job("plain-late", Some("2024-01-01T00:00:05Z")),
                low,
                urgent,
                due_job("plain-now", None),
            ],
        );

        let mut tx = store.begin().unwrap();
        let ids: Vec<String> = tx
            .select_acquirable_jobs(&AcquirableJobsQuery {
                now: "2024-06-01T00:00:00Z".parse().unwrap(),
                limit: 10,
            })
            .unwrap()
            .into_iter()
            .map(|r| r.key.id.into_string())
            .collect();
        assert_eq!(ids, vec!["urgent", "plain-now", "plain-late", "low"]);
    }

    #[test]
    fn select_by_field_matches_string_fields() {
        let store = InMemoryStore::new();
        let incident = |id: &str, job: &str| EntityRow {
            key: EntityKey::new(EntityType::Incident, id),
            revision: 1,
            data: json!({"job_id": job}),
        };
        seed(&store, &[incident("i1", "j1"), incident("i2", "j2"), incident("i3", "j1")]);

        let mut tx = store.begin().unwrap();
        let rows = tx
            .select_by_field(EntityType::Incident, "job_id", "j1")
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
