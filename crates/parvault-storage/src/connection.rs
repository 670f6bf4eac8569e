use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use parvault_core::{VaultError, VaultResult};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};

use crate::metrics::{StorageMetrics, StorageMetricsSnapshot};
use crate::schema;

const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Backoff applied when SQLite reports the database as locked or busy.
///
/// Retry `k` (0-based) sleeps `min(max_delay, initial_delay * 2^min(k, max_retries - 2))`,
/// so the final retry reuses the previous delay. The defaults sleep
/// 50, 100, 200, 400 and 400 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt
            .min(self.max_retries.saturating_sub(2))
            .min(MAX_BACKOFF_EXPONENT);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Cumulative sleep before `StorageLocked` is raised.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub wal_mode: bool,
    pub busy_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl StorageConfig {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("parvault.sqlite3"),
            wal_mode: true,
            busy_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Single SQLite connection shared by the service objects of one process.
///
/// Every public primitive retries transparently on `database is locked` /
/// `database is busy` according to [`RetryPolicy`].
pub struct Storage {
    conn: Mutex<Connection>,
    config: StorageConfig,
    metrics: StorageMetrics,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.config.db_path)
            .field("wal_mode", &self.config.wal_mode)
            .field("busy_timeout_ms", &self.config.busy_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Storage {
    pub fn open(config: StorageConfig) -> VaultResult<Self> {
        tracing::debug!(
            target: "parvault.storage",
            path = %config.db_path.display(),
            wal_mode = config.wal_mode,
            busy_timeout_ms = config.busy_timeout_ms,
            "opening storage connection"
        );

        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
            && config.db_path.as_os_str() != ":memory:"
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.db_path).map_err(map_storage_error)?;
        let storage = Self {
            conn: Mutex::new(conn),
            config,
            metrics: StorageMetrics::default(),
        };

        storage.metrics.record_open();
        storage.apply_pragmas()?;
        storage.with_retry("schema.bootstrap", schema::bootstrap)?;
        storage.metrics.record_schema_bootstrap();

        if let Ok(version) = schema::current_version(&storage.lock()) {
            tracing::debug!(
                target: "parvault.storage",
                schema_version = version,
                "storage bootstrap complete"
            );
        }

        Ok(storage)
    }

    pub fn open_in_memory() -> VaultResult<Self> {
        Self::open(StorageConfig::in_memory())
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> StorageMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> VaultResult<usize> {
        self.with_retry("execute", |conn| {
            conn.execute(sql, params).map_err(map_storage_error)
        })
    }

    /// Run a query and map every row.
    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut map: F) -> VaultResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_retry("query", |conn| query_rows(conn, sql, params, &mut map))
    }

    /// Run a query expected to return at most one row.
    pub fn query_optional<T, F>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        mut map: F,
    ) -> VaultResult<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_retry("query_optional", |conn| {
            conn.query_row(sql, params, &mut map)
                .optional()
                .map_err(map_storage_error)
        })
    }

    #[must_use]
    pub fn last_insert_id(&self) -> i64 {
        self.lock().last_insert_rowid()
    }

    pub fn table_exists(&self, name: &str) -> VaultResult<bool> {
        self.with_retry("table_exists", |conn| table_exists(conn, name))
    }

    /// Run read-only statements against the connection without opening a
    /// write transaction.
    pub fn read<T>(&self, f: impl FnMut(&Connection) -> VaultResult<T>) -> VaultResult<T> {
        self.with_retry("read", f)
    }

    /// Run `f` inside `BEGIN IMMEDIATE … COMMIT`.
    ///
    /// Errors roll back and propagate; a locked database rolls back and the
    /// whole closure is retried. Panics roll back and resume unwinding.
    pub fn transaction<F, T>(&self, mut f: F) -> VaultResult<T>
    where
        F: FnMut(&Connection) -> VaultResult<T>,
    {
        self.with_retry("transaction", |conn| self.transaction_once(conn, &mut f))
    }

    fn transaction_once<F, T>(&self, conn: &Connection, f: &mut F) -> VaultResult<T>
    where
        F: FnMut(&Connection) -> VaultResult<T>,
    {
        tracing::trace!(target: "parvault.storage", "starting storage transaction");

        conn.execute_batch("BEGIN IMMEDIATE;")
            .map_err(map_storage_error)?;

        let outcome = catch_unwind(AssertUnwindSafe(|| f(conn)));

        match outcome {
            Ok(Ok(value)) => {
                conn.execute_batch("COMMIT;").map_err(|commit_err| {
                    let _ = conn.execute_batch("ROLLBACK;");
                    map_storage_error(commit_err)
                })?;
                self.metrics.record_commit();
                tracing::trace!(target: "parvault.storage", "storage transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                let _ = conn.execute_batch("ROLLBACK;");
                self.metrics.record_rollback();
                tracing::debug!(
                    target: "parvault.storage",
                    ?err,
                    "storage transaction rolled back due to closure error"
                );
                Err(err)
            }
            Err(payload) => {
                let _ = conn.execute_batch("ROLLBACK;");
                self.metrics.record_rollback();
                tracing::error!(
                    target: "parvault.storage",
                    "storage transaction rolled back after panic"
                );
                resume_unwind(payload);
            }
        }
    }

    fn with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&Connection) -> VaultResult<T>,
    ) -> VaultResult<T> {
        retry_on_busy(&self.config.retry, &self.metrics, op, thread::sleep, || {
            let conn = self.lock();
            f(&conn)
        })
    }

    // A panic inside a transaction poisons the mutex after the rollback has
    // already run, so the connection itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_pragmas(&self) -> VaultResult<()> {
        tracing::trace!(
            target: "parvault.storage",
            wal_mode = self.config.wal_mode,
            busy_timeout_ms = self.config.busy_timeout_ms,
            "applying storage pragmas"
        );

        let conn = self.lock();
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_storage_error)?;
        let journal_mode = if self.config.wal_mode { "WAL" } else { "DELETE" };
        let applied: String = conn
            .pragma_update_and_check(None, "journal_mode", journal_mode, |row| row.get(0))
            .map_err(map_storage_error)?;
        tracing::trace!(target: "parvault.storage", journal_mode = %applied, "journal mode set");
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .map_err(map_storage_error)?;
        Ok(())
    }
}

/// Retry `f` while it fails with a locked/busy database.
///
/// `sleep` is injected so the schedule can be observed without waiting.
pub fn retry_on_busy<T>(
    policy: &RetryPolicy,
    metrics: &StorageMetrics,
    op: &'static str,
    mut sleep: impl FnMut(Duration),
    mut f: impl FnMut() -> VaultResult<T>,
) -> VaultResult<T> {
    let mut attempt: u32 = 0;
    let mut waited = Duration::ZERO;
    loop {
        match f() {
            Err(error) if is_busy(&error) => {
                if attempt >= policy.max_retries {
                    metrics.record_locked_failure();
                    let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        target: "parvault.storage",
                        op,
                        attempts = attempt,
                        waited_ms,
                        "database still locked after retries"
                    );
                    return Err(VaultError::StorageLocked {
                        attempts: attempt,
                        waited_ms,
                    });
                }
                let delay = policy.delay_for(attempt);
                metrics.record_busy_retry();
                tracing::debug!(
                    target: "parvault.storage",
                    op,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "database locked, backing off"
                );
                sleep(delay);
                waited += delay;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Whether `error` is SQLite reporting a locked or busy database.
#[must_use]
pub fn is_busy(error: &VaultError) -> bool {
    let VaultError::SubsystemError {
        subsystem: "storage",
        source,
    } = error
    else {
        return false;
    };
    match source.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => {
            let message = source.to_string();
            message.contains("database is locked") || message.contains("database is busy")
        }
    }
}

pub(crate) fn query_rows<T, F>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    map: F,
) -> VaultResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare_cached(sql).map_err(map_storage_error)?;
    let rows = stmt.query_map(params, map).map_err(map_storage_error)?;
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(map_storage_error)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> VaultResult<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1;",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(map_storage_error)
}

pub(crate) fn map_storage_error<E>(source: E) -> VaultError
where
    E: std::error::Error + Send + Sync + 'static,
{
    VaultError::SubsystemError {
        subsystem: "storage",
        source: Box::new(source),
    }
}
