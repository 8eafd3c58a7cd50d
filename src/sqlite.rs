use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::entry::Entry;
use crate::error::PhysicalError;
use crate::path;
use crate::retry::{RetryPolicy, retry_on_abort};
use crate::sql::validate_table;
use crate::traits::{Backend, Transactional, Txn, TxnBody};

/// SqliteBackend maps entries onto rows of an SQLite table
/// (`path TEXT PRIMARY KEY, value BLOB`).
///
/// It shares the row layout and listing reduction of the CockroachDB
/// backend, which makes it a serverless stand-in for the relational path.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    table: String,
    retry: RetryPolicy,
}

/// Map a rusqlite error onto the storage taxonomy. Lock contention is a
/// conflict: an abort inside a batch, a write conflict outside one.
fn classify(e: rusqlite::Error, in_txn: bool) -> PhysicalError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            if in_txn {
                PhysicalError::TransactionAborted(e.to_string())
            } else {
                PhysicalError::WriteConflict(e.to_string())
            }
        }
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            PhysicalError::Unavailable(e.to_string())
        }
        _ => PhysicalError::Storage(e.to_string()),
    }
}

impl SqliteBackend {
    /// Open or create a SQLite database at the given path.
    pub fn open(
        path: &Path,
        table: &str,
        busy_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, PhysicalError> {
        let conn = Connection::open(path).map_err(|e| PhysicalError::Unavailable(e.to_string()))?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| PhysicalError::Unavailable(e.to_string()))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| PhysicalError::Unavailable(e.to_string()))?;

        Self::with_connection(conn, table, retry)
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn open_in_memory(table: &str) -> Result<Self, PhysicalError> {
        Self::open_in_memory_with_retry(table, RetryPolicy::default())
    }

    pub fn open_in_memory_with_retry(table: &str, retry: RetryPolicy) -> Result<Self, PhysicalError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PhysicalError::Unavailable(e.to_string()))?;
        Self::with_connection(conn, table, retry)
    }

    fn with_connection(
        conn: Connection,
        table: &str,
        retry: RetryPolicy,
    ) -> Result<Self, PhysicalError> {
        let table = validate_table(table)?.to_string();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                path  TEXT NOT NULL PRIMARY KEY,
                value BLOB NOT NULL
            )"
        ))
        .map_err(|e| PhysicalError::Schema(e.to_string()))?;
        debug!("sqlite backend ready, table {}", table);

        Ok(Self {
            conn: Mutex::new(conn),
            table,
            retry,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Delete every row in the table.
    pub fn truncate(&self) -> Result<(), PhysicalError> {
        let conn = self.lock()?;
        conn.execute(&format!("DELETE FROM {}", self.table), [])
            .map_err(|e| classify(e, false))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PhysicalError> {
        self.conn
            .lock()
            .map_err(|e| PhysicalError::Storage(e.to_string()))
    }
}

fn row_get(
    conn: &Connection,
    table: &str,
    key: &str,
    in_txn: bool,
) -> Result<Option<Entry>, PhysicalError> {
    let value: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT value FROM {table} WHERE path = ?1"),
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| classify(e, in_txn))?;
    Ok(value.map(|value| Entry::new(key, value)))
}

fn row_put(conn: &Connection, table: &str, entry: &Entry, in_txn: bool) -> Result<(), PhysicalError> {
    let key = path::normalize(&entry.key)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (path, value) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET value = excluded.value"
        ),
        params![key, entry.value],
    )
    .map_err(|e| classify(e, in_txn))?;
    Ok(())
}

fn row_delete(conn: &Connection, table: &str, key: &str, in_txn: bool) -> Result<(), PhysicalError> {
    conn.execute(&format!("DELETE FROM {table} WHERE path = ?1"), params![key])
        .map_err(|e| classify(e, in_txn))?;
    Ok(())
}

fn row_list(
    conn: &Connection,
    table: &str,
    prefix: &str,
    in_txn: bool,
) -> Result<Vec<String>, PhysicalError> {
    // substr comparison instead of LIKE: SQLite's LIKE ignores ASCII case.
    let mut stmt = conn
        .prepare(&format!(
            "SELECT path FROM {table} WHERE substr(path, 1, length(?1)) = ?1"
        ))
        .map_err(|e| classify(e, in_txn))?;
    let rows = stmt
        .query_map(params![prefix], |row| row.get::<_, String>(0))
        .map_err(|e| classify(e, in_txn))?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row.map_err(|e| classify(e, in_txn))?);
    }
    Ok(path::children(keys, prefix))
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        let conn = self.lock()?;
        row_get(&conn, &self.table, key, false)
    }

    fn put(&self, entry: &Entry) -> Result<(), PhysicalError> {
        let conn = self.lock()?;
        row_put(&conn, &self.table, entry, false)
    }

    fn delete(&self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        let conn = self.lock()?;
        row_delete(&conn, &self.table, key, false)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        let conn = self.lock()?;
        row_list(&conn, &self.table, prefix, false)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for SqliteBackend {
    fn run(&self, body: &mut TxnBody<'_>) -> Result<(), PhysicalError> {
        retry_on_abort(&self.retry, || {
            let mut conn = self.lock()?;
            // IMMEDIATE takes the write lock up front so two writers cannot
            // both read a value and then race to update it.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| classify(e, true))?;
            {
                let mut txn = SqliteTxn {
                    conn: &tx,
                    table: &self.table,
                };
                let handle: &mut dyn Txn = &mut txn;
                body(handle)?;
            }
            tx.commit().map_err(|e| classify(e, true))
        })
    }
}

struct SqliteTxn<'a> {
    conn: &'a Connection,
    table: &'a str,
}

impl Txn for SqliteTxn<'_> {
    fn get(&mut self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        row_get(self.conn, self.table, key, true)
    }

    fn put(&mut self, entry: &Entry) -> Result<(), PhysicalError> {
        row_put(self.conn, self.table, entry, true)
    }

    fn delete(&mut self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        row_delete(self.conn, self.table, key, true)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        row_list(self.conn, self.table, prefix, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_case_sensitive() {
        let backend = SqliteBackend::open_in_memory("kv").unwrap();
        backend.put(&Entry::new("Foo/a", b"1".to_vec())).unwrap();
        backend.put(&Entry::new("foo/b", b"2".to_vec())).unwrap();
        assert_eq!(backend.list("foo/").unwrap(), vec!["b"]);
        assert_eq!(backend.list("").unwrap(), vec!["Foo/", "foo/"]);
    }

    #[test]
    fn list_treats_wildcards_literally() {
        let backend = SqliteBackend::open_in_memory("kv").unwrap();
        backend.put(&Entry::new("a%/x", b"1".to_vec())).unwrap();
        backend.put(&Entry::new("ab/y", b"2".to_vec())).unwrap();
        assert_eq!(backend.list("a%/").unwrap(), vec!["x"]);
    }

    #[test]
    fn upsert_overwrites() {
        let backend = SqliteBackend::open_in_memory("kv").unwrap();
        backend.put(&Entry::new("k", b"1".to_vec())).unwrap();
        backend.put(&Entry::new("k", b"2".to_vec())).unwrap();
        assert_eq!(backend.get("k").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn rejects_bad_table_name() {
        let err = SqliteBackend::open_in_memory("kv; DROP TABLE x").err().unwrap();
        assert!(matches!(err, PhysicalError::Config(_)));
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("kv.sqlite");
        {
            let backend =
                SqliteBackend::open(&db, "kv", Duration::from_secs(1), RetryPolicy::default())
                    .unwrap();
            backend
                .transact(&[crate::entry::Operation::put("core/seal", b"x".to_vec())])
                .unwrap();
        }
        let backend =
            SqliteBackend::open(&db, "kv", Duration::from_secs(1), RetryPolicy::default()).unwrap();
        assert_eq!(backend.get("core/seal").unwrap().unwrap().value, b"x");
        backend.truncate().unwrap();
        assert!(backend.get("core/seal").unwrap().is_none());
    }

    #[test]
    fn failed_body_rolls_back() {
        let backend = SqliteBackend::open_in_memory("kv").unwrap();
        let result = backend.run(&mut |txn| {
            txn.put(&Entry::new("ghost", b"1".to_vec()))?;
            Err(PhysicalError::Storage("boom".into()))
        });
        assert!(result.is_err());
        assert!(backend.get("ghost").unwrap().is_none());
    }

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
    }

    fn patient() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 500,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
        }
    }

    fn open_shared(db: &Path, retry: RetryPolicy) -> SqliteBackend {
        SqliteBackend::open(db, "kv", Duration::ZERO, retry).unwrap()
    }

    #[test]
    fn busy_is_abort_inside_txn_and_conflict_outside() {
        assert!(matches!(classify(busy(), true), PhysicalError::TransactionAborted(_)));
        assert!(matches!(classify(busy(), false), PhysicalError::WriteConflict(_)));
        assert!(classify(busy(), true).is_retryable());
        assert!(!classify(busy(), false).is_retryable());
    }

    #[test]
    fn locked_database_aborts_batches_and_conflicts_lone_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("locked.sqlite");
        let backend = open_shared(
            &db,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        );

        let holder = Connection::open(&db).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = backend
            .transact(&[crate::entry::Operation::put("a", b"1".to_vec())])
            .unwrap_err();
        assert!(matches!(err, PhysicalError::TransactionAborted(_)), "{err:?}");
        let err = backend.put(&Entry::new("a", b"1".to_vec())).unwrap_err();
        assert!(matches!(err, PhysicalError::WriteConflict(_)), "{err:?}");

        holder.execute_batch("ROLLBACK").unwrap();
        backend.put(&Entry::new("a", b"1".to_vec())).unwrap();
    }

    #[test]
    fn aborted_batch_retries_once_lock_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("release.sqlite");
        let backend = open_shared(&db, patient());

        let holder = Connection::open(&db).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();
        let mut attempts = 0;
        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                holder.execute_batch("COMMIT").unwrap();
            });
            backend
                .run(&mut |txn| {
                    attempts += 1;
                    txn.put(&Entry::new("k", b"v".to_vec()))
                })
                .unwrap();
        });
        assert!(attempts > 1);
        assert_eq!(backend.get("k").unwrap().unwrap().value, b"v");
    }

    #[test]
    fn concurrent_handles_do_not_lose_increments() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("counter.sqlite");
        let handles = [open_shared(&db, patient()), open_shared(&db, patient())];

        std::thread::scope(|s| {
            for backend in &handles {
                s.spawn(move || {
                    for _ in 0..50 {
                        backend
                            .run(&mut |txn| {
                                let current = match txn.get("counter")? {
                                    Some(entry) => String::from_utf8_lossy(&entry.value)
                                        .parse::<u64>()
                                        .map_err(|e| PhysicalError::Storage(e.to_string()))?,
                                    None => 0,
                                };
                                txn.put(&Entry::new("counter", (current + 1).to_string()))
                            })
                            .unwrap();
                    }
                });
            }
        });

        let total = handles[0].get("counter").unwrap().unwrap().value;
        assert_eq!(total, b"100");
    }

    #[test]
    fn in_memory_keeps_retry_policy() {
        let backend = SqliteBackend::open_in_memory_with_retry("kv", patient()).unwrap();
        assert_eq!(backend.retry_policy(), &patient());
    }
}
