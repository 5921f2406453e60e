use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use policybatch_core::{StoreError, UserId};

use super::{TransactionScope, TransactionalStore};
use crate::context::ExecutionContext;

type RowId = (String, String, String);

#[derive(Debug, Clone)]
struct Versioned {
    value: JsonValue,
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    rows: BTreeMap<RowId, Versioned>,
    next_version: u64,
    faults: VecDeque<StoreError>,
    stats: StoreStats,
}

/// Counters of scope lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed_commits: u64,
}

/// In-memory store with optimistic concurrency.
///
/// A commit fails with [`StoreError::Conflict`] when any row read by the
/// transaction was changed by another commit in the meantime, which is the
/// behaviour of a serializable database under contention. Faults can be
/// injected on the next commits for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a committed row outside of any transaction.
    pub fn seed(&self, database: &str, table: &str, key: &str, value: JsonValue) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.next_version += 1;
            let version = shared.next_version;
            shared.rows.insert(
                (database.to_string(), table.to_string(), key.to_string()),
                Versioned { value, version },
            );
        }
    }

    /// Committed value of a row.
    pub fn get(&self, database: &str, table: &str, key: &str) -> Option<JsonValue> {
        let shared = self.shared.lock().ok()?;
        shared
            .rows
            .get(&(database.to_string(), table.to_string(), key.to_string()))
            .map(|row| row.value.clone())
    }

    /// Make the next `times` commits fail with `error`.
    pub fn fail_next_commits(&self, error: StoreError, times: usize) {
        if let Ok(mut shared) = self.shared.lock() {
            shared
                .faults
                .extend(std::iter::repeat_n(error, times));
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.shared
            .lock()
            .map(|shared| shared.stats)
            .unwrap_or_default()
    }
}

impl TransactionalStore for InMemoryStore {
    fn start(
        &self,
        database: &str,
        user: UserId,
        readonly: bool,
    ) -> Result<Box<dyn TransactionScope>, StoreError> {
        self.shared.lock().map_err(poisoned)?.stats.started += 1;
        Ok(Box::new(InMemoryScope {
            shared: Arc::clone(&self.shared),
            database: database.to_string(),
            user,
            readonly,
            context: ExecutionContext::default(),
            observed: HashMap::new(),
            pending: BTreeMap::new(),
        }))
    }
}

struct InMemoryScope {
    shared: Arc<Mutex<Shared>>,
    database: String,
    user: UserId,
    readonly: bool,
    context: ExecutionContext,
    // version seen at first read, 0 for absent rows
    observed: HashMap<(String, String), u64>,
    // None marks a deletion
    pending: BTreeMap<(String, String), Option<JsonValue>>,
}

impl InMemoryScope {
    fn row_id(&self, table: &str, key: &str) -> RowId {
        (self.database.clone(), table.to_string(), key.to_string())
    }

    fn ensure_writable(&self, table: &str) -> Result<(), StoreError> {
        if self.readonly {
            return Err(StoreError::ReadOnly(format!("write to {table}")));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.observed.clear();
        self.pending.clear();
    }
}

impl TransactionScope for InMemoryScope {
    fn database(&self) -> &str {
        &self.database
    }

    fn user(&self) -> UserId {
        self.user
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    fn set_context(&mut self, context: ExecutionContext) {
        self.context = context;
    }

    fn read(&mut self, table: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let local = (table.to_string(), key.to_string());
        if let Some(value) = self.pending.get(&local) {
            return Ok(value.clone());
        }

        let row_id = self.row_id(table, key);
        let shared = self.shared.lock().map_err(poisoned)?;
        let row = shared.rows.get(&row_id);
        self.observed
            .entry(local)
            .or_insert_with(|| row.map_or(0, |r| r.version));
        Ok(row.map(|r| r.value.clone()))
    }

    fn write(&mut self, table: &str, key: &str, value: JsonValue) -> Result<(), StoreError> {
        self.ensure_writable(table)?;
        self.pending
            .insert((table.to_string(), key.to_string()), Some(value));
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError> {
        self.ensure_writable(table)?;
        let existed = self.read(table, key)?.is_some();
        self.pending.insert((table.to_string(), key.to_string()), None);
        Ok(existed)
    }

    fn keys(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: BTreeSet<String> = {
            let shared = self.shared.lock().map_err(poisoned)?;
            shared
                .rows
                .keys()
                .filter(|(db, tbl, _)| db == &self.database && tbl == table)
                .map(|(_, _, key)| key.clone())
                .collect()
        };
        for ((tbl, key), value) in &self.pending {
            if tbl != table {
                continue;
            }
            if value.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().map_err(poisoned)?;

        if let Some(fault) = shared.faults.pop_front() {
            shared.stats.failed_commits += 1;
            return Err(fault);
        }

        for ((table, key), seen) in &self.observed {
            let row_id = (self.database.clone(), table.clone(), key.clone());
            let current = shared.rows.get(&row_id).map_or(0, |r| r.version);
            if current != *seen {
                shared.stats.failed_commits += 1;
                return Err(StoreError::conflict(format!(
                    "could not serialize access to {table}/{key}"
                )));
            }
        }

        for ((table, key), value) in std::mem::take(&mut self.pending) {
            let row_id = (self.database.clone(), table, key);
            match value {
                Some(value) => {
                    shared.next_version += 1;
                    let version = shared.next_version;
                    shared.rows.insert(row_id, Versioned { value, version });
                }
                None => {
                    shared.rows.remove(&row_id);
                }
            }
        }
        shared.stats.committed += 1;
        drop(shared);

        self.observed.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.reset();
        self.shared.lock().map_err(poisoned)?.stats.rolled_back += 1;
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::backend("in-memory store lock poisoned")
}
