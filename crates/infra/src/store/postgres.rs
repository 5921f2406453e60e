//! Postgres-backed transactional store.
//!
//! Rows live in a single key-value table:
//!
//! ```sql
//! CREATE TABLE batch_records (tbl text, key text, value jsonb, PRIMARY KEY (tbl, key))
//! ```
//!
//! Every scope runs SERIALIZABLE, so concurrent jobs touching the same rows
//! fail with a serialization error instead of blocking on locks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001` | `Conflict` | Serialization failure |
//! | Database | `40P01` | `Conflict` | Deadlock detected |
//! | Database | `08xxx` | `Operational` | Connection exception |
//! | Database | `25006` | `ReadOnly` | Write in a read-only transaction |
//! | Database | Any other | `Backend` | Other database errors |
//! | PoolTimedOut, PoolClosed, Io, Tls | N/A | `Operational` | Pool or network failure |
//! | Other | N/A | `Backend` | Decoding errors and the like |
//!
//! ## Runtime
//!
//! The store is synchronous. It owns a multi-threaded tokio [`Runtime`] that
//! drives sqlx, and every scope call blocks on it. Scopes must be used from
//! threads that are not running async code (worker threads are plain
//! `std::thread`s); a call from inside an async context is refused with
//! [`StoreError::Backend`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, instrument};

use policybatch_batch::{ExecutionContext, TransactionScope, TransactionalStore};
use policybatch_core::{StoreError, UserId};

use crate::config::Settings;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_records (
    tbl TEXT NOT NULL,
    key TEXT NOT NULL,
    value JSONB NOT NULL,
    PRIMARY KEY (tbl, key)
)
"#;

/// How long a scope waits for a pooled connection.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    runtime: Arc<Runtime>,
    database: String,
}

impl PostgresStore {
    /// Connect to `url` on a runtime owned by the store.
    pub fn connect(url: &str, database: impl Into<String>) -> Result<Self, StoreError> {
        let runtime = Runtime::new()
            .map_err(|e| StoreError::backend(format!("failed to create runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .acquire_timeout(ACQUIRE_TIMEOUT)
                    .connect(url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, Arc::new(runtime), database);
        info!(database = %store.database, "postgres store connected");
        Ok(store)
    }

    /// Store on `settings.database_url`, serving `settings.database`.
    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        let url = settings
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::backend("DATABASE_URL is not set"))?;
        Self::connect(url, settings.database.clone())
    }

    /// Store over `pool`. The pool must have been created on `runtime`.
    pub fn new(pool: PgPool, runtime: Arc<Runtime>, database: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            database: database.into(),
        }
    }

    /// Create the records table if missing.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        block_on(&self.runtime, async move {
            sqlx::query(SCHEMA)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))
        })??;
        Ok(())
    }
}

/// Run `future` to completion on `runtime`.
fn block_on<F>(runtime: &Runtime, future: F) -> Result<F::Output, StoreError>
where
    F: std::future::Future,
{
    if Handle::try_current().is_ok() {
        return Err(StoreError::backend(
            "PostgresStore cannot block inside an async context; call it from a worker thread",
        ));
    }
    Ok(runtime.block_on(future))
}

impl TransactionalStore for PostgresStore {
    fn start(
        &self,
        database: &str,
        user: UserId,
        readonly: bool,
    ) -> Result<Box<dyn TransactionScope>, StoreError> {
        if database != self.database {
            return Err(StoreError::backend(format!(
                "unknown database {database} (store serves {})",
                self.database
            )));
        }
        Ok(Box::new(PostgresScope {
            pool: self.pool.clone(),
            runtime: self.runtime.clone(),
            tx: None,
            database: database.to_string(),
            user,
            readonly,
            context: ExecutionContext::default(),
        }))
    }
}

/// One scope. The database transaction is opened lazily on first access
/// and again after every commit or rollback.
pub struct PostgresScope {
    pool: Arc<PgPool>,
    runtime: Arc<Runtime>,
    tx: Option<Transaction<'static, Postgres>>,
    database: String,
    user: UserId,
    readonly: bool,
    context: ExecutionContext,
}

impl PostgresScope {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        if self.tx.is_none() {
            let tx = block_on(&self.runtime, begin(&self.pool, self.readonly))??;
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::backend("transaction not started"))
    }

    fn check_writable(&self, table: &str) -> Result<(), StoreError> {
        if self.readonly {
            return Err(StoreError::ReadOnly(format!("cannot write {table}")));
        }
        Ok(())
    }
}

async fn begin(pool: &PgPool, readonly: bool) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
    let mode = if readonly {
        "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY"
    } else {
        "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
    };
    sqlx::query(mode)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin", e))?;
    Ok(tx)
}

impl TransactionScope for PostgresScope {
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

    #[instrument(skip(self), fields(database = %self.database), err)]
    fn read(&mut self, table: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let runtime = self.runtime.clone();
        let tx = self.tx()?;
        block_on(
            &runtime,
            sqlx::query_scalar::<_, JsonValue>(
                r#"SELECT value FROM batch_records WHERE tbl = $1 AND key = $2"#,
            )
            .bind(table)
            .bind(key)
            .fetch_optional(&mut **tx),
        )?
        .map_err(|e| map_sqlx_error("read", e))
    }

    #[instrument(skip(self, value), fields(database = %self.database), err)]
    fn write(&mut self, table: &str, key: &str, value: JsonValue) -> Result<(), StoreError> {
        self.check_writable(table)?;
        let runtime = self.runtime.clone();
        let tx = self.tx()?;
        block_on(
            &runtime,
            sqlx::query(
                r#"
                INSERT INTO batch_records (tbl, key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (tbl, key) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(table)
            .bind(key)
            .bind(value)
            .execute(&mut **tx),
        )?
        .map_err(|e| map_sqlx_error("write", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(database = %self.database), err)]
    fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError> {
        self.check_writable(table)?;
        let runtime = self.runtime.clone();
        let tx = self.tx()?;
        let result = block_on(
            &runtime,
            sqlx::query(r#"DELETE FROM batch_records WHERE tbl = $1 AND key = $2"#)
                .bind(table)
                .bind(key)
                .execute(&mut **tx),
        )?
        .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    fn keys(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let runtime = self.runtime.clone();
        let tx = self.tx()?;
        block_on(
            &runtime,
            sqlx::query_scalar::<_, String>(
                r#"SELECT key FROM batch_records WHERE tbl = $1 ORDER BY key"#,
            )
            .bind(table)
            .fetch_all(&mut **tx),
        )?
        .map_err(|e| map_sqlx_error("keys", e))
    }

    #[instrument(skip(self), fields(database = %self.database, user = %self.user), err)]
    fn commit(&mut self) -> Result<(), StoreError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        block_on(&self.runtime, tx.commit())?.map_err(|e| map_sqlx_error("commit", e))?;
        debug!(database = %self.database, "transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        block_on(&self.runtime, tx.rollback())?.map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map sqlx errors to StoreError with appropriate context.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) => classify_sqlstate(&code, msg),
                None => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Operational(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Operational(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Operational(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Operational(format!("tls error in {}: {}", operation, e)),
        other => StoreError::Backend(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn classify_sqlstate(code: &str, msg: String) -> StoreError {
    match code {
        "40001" | "40P01" => StoreError::Conflict(msg),
        "25006" => StoreError::ReadOnly(msg),
        c if c.starts_with("08") => StoreError::Operational(msg),
        _ => StoreError::Backend(msg),
    }
}
