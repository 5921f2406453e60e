//! Transactional store boundary.
//!
//! A [`TransactionScope`] is one database transaction opened for a user.
//! Scopes may commit several times (each commit starts a new transaction on
//! the same scope) which is how a job bounds the size of its commits.
//!
//! [`run_in_transaction`] is the scoped form: it always ends the scope with
//! a commit or a rollback and reports the outcome as a `Result`.

mod in_memory;

pub use in_memory::{InMemoryStore, StoreStats};

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::warn;

use policybatch_core::{BatchResult, StoreError, UserId};

use crate::context::ExecutionContext;

/// One open transaction.
pub trait TransactionScope: Send {
    fn database(&self) -> &str;

    fn user(&self) -> UserId;

    fn is_readonly(&self) -> bool;

    fn context(&self) -> &ExecutionContext;

    fn set_context(&mut self, context: ExecutionContext);

    fn read(&mut self, table: &str, key: &str) -> Result<Option<JsonValue>, StoreError>;

    fn write(&mut self, table: &str, key: &str, value: JsonValue) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError>;

    /// Keys of `table` as seen by this transaction, sorted.
    fn keys(&mut self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Make the pending changes durable.
    ///
    /// Serialization failures surface here as [`StoreError::Conflict`].
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the changes made since the last commit.
    fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Factory of transaction scopes.
pub trait TransactionalStore: Send + Sync {
    fn start(
        &self,
        database: &str,
        user: UserId,
        readonly: bool,
    ) -> Result<Box<dyn TransactionScope>, StoreError>;
}

impl<S> TransactionalStore for Arc<S>
where
    S: TransactionalStore + ?Sized,
{
    fn start(
        &self,
        database: &str,
        user: UserId,
        readonly: bool,
    ) -> Result<Box<dyn TransactionScope>, StoreError> {
        (**self).start(database, user, readonly)
    }
}

/// Run `body` in a fresh scope.
///
/// On `Ok` the scope is committed; if the commit fails it is rolled back
/// and the commit error is returned. On `Err` the scope is rolled back and
/// the body's error is returned. A failing rollback is logged and never
/// replaces the original error.
pub fn run_in_transaction<S, T, F>(
    store: &S,
    database: &str,
    user: UserId,
    readonly: bool,
    body: F,
) -> BatchResult<T>
where
    S: TransactionalStore + ?Sized,
    F: FnOnce(&mut dyn TransactionScope) -> BatchResult<T>,
{
    let mut scope = store.start(database, user, readonly)?;

    match body(scope.as_mut()) {
        Ok(value) => match scope.commit() {
            Ok(()) => Ok(value),
            Err(err) => {
                rollback_quietly(scope.as_mut());
                Err(err.into())
            }
        },
        Err(err) => {
            rollback_quietly(scope.as_mut());
            Err(err)
        }
    }
}

pub(crate) fn rollback_quietly(scope: &mut dyn TransactionScope) {
    if let Err(err) = scope.rollback() {
        warn!(database = scope.database(), error = %err, "rollback failed");
    }
}

/// Read and deserialize one row.
pub fn read_row<T>(scope: &mut dyn TransactionScope, table: &str, key: &str) -> BatchResult<Option<T>>
where
    T: DeserializeOwned,
{
    match scope.read(table, key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write one row.
pub fn write_row<T>(scope: &mut dyn TransactionScope, table: &str, key: &str, row: &T) -> BatchResult<()>
where
    T: Serialize,
{
    scope.write(table, key, serde_json::to_value(row)?)?;
    Ok(())
}
