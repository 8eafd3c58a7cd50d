//! CockroachDB backend.
//!
//! Entries are rows of `(path STRING PRIMARY KEY, value BYTES)`. CockroachDB
//! runs every transaction at SERIALIZABLE isolation and resolves conflicts
//! by aborting one side with SQLSTATE 40001, so atomic batches go through
//! [`retry_on_abort`] and are re-run from the top until they commit or the
//! retry budget is spent.

use std::error::Error as _;
use std::time::Duration;

use postgres::error::SqlState;
use postgres::{Client, GenericClient, NoTls};
use r2d2::{CustomizeConnection, Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{debug, info};

use crate::entry::Entry;
use crate::error::PhysicalError;
use crate::path;
use crate::retry::{RetryPolicy, retry_on_abort};
use crate::sql::{like_prefix, validate_table};
use crate::traits::{Backend, Transactional, Txn, TxnBody};

pub const DEFAULT_TABLE: &str = "vault_kv_store";
pub const DEFAULT_MAX_PARALLEL: u32 = 128;

type Manager = PostgresConnectionManager<NoTls>;

/// Connection settings for [`CockroachBackend`].
#[derive(Debug, Clone)]
pub struct CockroachConfig {
    /// `postgresql://user@host:26257/db?sslmode=disable`. Passed to the
    /// driver untouched.
    pub connection_url: String,
    pub table: String,
    /// Upper bound on concurrent connections to the cluster.
    pub max_parallel: u32,
    /// Per-statement deadline. Zero disables it.
    pub statement_timeout: Duration,
    /// How long to wait for a connection, fresh or pooled.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl CockroachConfig {
    pub fn new(connection_url: impl Into<String>) -> Self {
        Self {
            connection_url: connection_url.into(),
            table: DEFAULT_TABLE.to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            statement_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Applies per-session settings to every new pooled connection.
#[derive(Debug)]
struct SessionSetup {
    statement_timeout_ms: u128,
}

impl CustomizeConnection<Client, postgres::Error> for SessionSetup {
    fn on_acquire(&self, conn: &mut Client) -> Result<(), postgres::Error> {
        conn.batch_execute(&format!(
            "SET statement_timeout = {}",
            self.statement_timeout_ms
        ))
    }
}

/// Map a driver error onto the storage taxonomy.
///
/// Serialization failures are `TransactionAborted` inside a batch (and get
/// retried) but `WriteConflict` for a lone statement. Errors without a
/// SQLSTATE are connectivity failures only when the connection is gone or
/// the socket failed; client-side encoding errors are plain storage errors.
fn classify(e: postgres::Error, in_txn: bool) -> PhysicalError {
    let lost = e.is_closed() || e.source().is_some_and(|s| s.is::<std::io::Error>());
    classify_state(e.code(), lost, in_txn, e.to_string())
}

fn classify_state(
    code: Option<&SqlState>,
    connection_lost: bool,
    in_txn: bool,
    message: String,
) -> PhysicalError {
    let Some(code) = code else {
        return if connection_lost {
            PhysicalError::Unavailable(message)
        } else {
            PhysicalError::Storage(message)
        };
    };
    if *code == SqlState::T_R_SERIALIZATION_FAILURE || *code == SqlState::T_R_DEADLOCK_DETECTED {
        if in_txn {
            PhysicalError::TransactionAborted(message)
        } else {
            PhysicalError::WriteConflict(message)
        }
    } else if *code == SqlState::QUERY_CANCELED {
        PhysicalError::Timeout(message)
    } else if *code == SqlState::T_R_STATEMENT_COMPLETION_UNKNOWN
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
    {
        PhysicalError::Unavailable(message)
    } else {
        PhysicalError::Storage(message)
    }
}

/// A column that does not decode means the table was not created by us.
fn column_err(table: &str, e: postgres::Error) -> PhysicalError {
    PhysicalError::Schema(format!("unexpected column type in {table}: {e}"))
}

/// CockroachBackend is a Backend implementation backed by a CockroachDB
/// cluster, reached over the PostgreSQL wire protocol.
pub struct CockroachBackend {
    pool: Pool<Manager>,
    table: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CockroachBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CockroachBackend")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl CockroachBackend {
    /// Connect and make sure the table exists.
    ///
    /// A failure to create the table is fatal: no handle is returned.
    pub fn new(config: CockroachConfig) -> Result<Self, PhysicalError> {
        let table = validate_table(&config.table)?.to_string();

        let mut pg_config: postgres::Config = config
            .connection_url
            .parse()
            .map_err(|e: postgres::Error| PhysicalError::Config(e.to_string()))?;
        pg_config.connect_timeout(config.connect_timeout);

        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(config.max_parallel.max(1))
            .min_idle(Some(1))
            .connection_timeout(config.connect_timeout)
            .connection_customizer(Box::new(SessionSetup {
                statement_timeout_ms: config.statement_timeout.as_millis(),
            }))
            .build(manager)
            .map_err(|e| PhysicalError::Unavailable(e.to_string()))?;

        let backend = Self {
            pool,
            table,
            retry: config.retry,
        };
        backend.ensure_table()?;
        info!(
            "cockroachdb backend ready, table {}, max_parallel {}",
            backend.table, config.max_parallel
        );
        Ok(backend)
    }

    fn ensure_table(&self) -> Result<(), PhysicalError> {
        let mut conn = self.conn()?;
        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (path STRING, value BYTES, PRIMARY KEY (path))",
            self.table
        ))
        .map_err(|e| PhysicalError::Schema(e.to_string()))?;
        debug!("ensured table {}", self.table);
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Remove every row. Meant for resetting state between test phases.
    pub fn truncate(&self) -> Result<(), PhysicalError> {
        let mut conn = self.conn()?;
        conn.batch_execute(&format!("TRUNCATE TABLE {}", self.table))
            .map_err(|e| classify(e, false))
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, PhysicalError> {
        self.pool
            .get()
            .map_err(|e| PhysicalError::Unavailable(e.to_string()))
    }
}

// Row operations are written once against GenericClient so the same SQL
// serves both lone statements and statements inside a transaction.

fn row_get(
    client: &mut impl GenericClient,
    table: &str,
    key: &str,
    in_txn: bool,
) -> Result<Option<Entry>, PhysicalError> {
    let sql = format!("SELECT value FROM {table} WHERE path = $1");
    let row = client
        .query_opt(sql.as_str(), &[&key])
        .map_err(|e| classify(e, in_txn))?;
    match row {
        Some(row) => {
            let value: Vec<u8> = row.try_get(0).map_err(|e| column_err(table, e))?;
            Ok(Some(Entry::new(key, value)))
        }
        None => Ok(None),
    }
}

fn row_put(
    client: &mut impl GenericClient,
    table: &str,
    entry: &Entry,
    in_txn: bool,
) -> Result<(), PhysicalError> {
    let key = path::normalize(&entry.key)?;
    let sql = format!("UPSERT INTO {table} (path, value) VALUES ($1, $2)");
    client
        .execute(sql.as_str(), &[&key, &entry.value])
        .map_err(|e| classify(e, in_txn))?;
    Ok(())
}

fn row_delete(
    client: &mut impl GenericClient,
    table: &str,
    key: &str,
    in_txn: bool,
) -> Result<(), PhysicalError> {
    let sql = format!("DELETE FROM {table} WHERE path = $1");
    client
        .execute(sql.as_str(), &[&key])
        .map_err(|e| classify(e, in_txn))?;
    Ok(())
}

fn row_list(
    client: &mut impl GenericClient,
    table: &str,
    prefix: &str,
    in_txn: bool,
) -> Result<Vec<String>, PhysicalError> {
    let pattern = like_prefix(prefix);
    let sql = format!("SELECT path FROM {table} WHERE path LIKE $1");
    let rows = client
        .query(sql.as_str(), &[&pattern])
        .map_err(|e| classify(e, in_txn))?;
    let keys = rows
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| column_err(table, e))?;
    Ok(path::children(keys, prefix))
}

impl Backend for CockroachBackend {
    fn name(&self) -> &'static str {
        "cockroachdb"
    }

    fn get(&self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        let mut conn = self.conn()?;
        row_get(&mut *conn, &self.table, key, false)
    }

    fn put(&self, entry: &Entry) -> Result<(), PhysicalError> {
        let mut conn = self.conn()?;
        row_put(&mut *conn, &self.table, entry, false)
    }

    fn delete(&self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        let mut conn = self.conn()?;
        row_delete(&mut *conn, &self.table, key, false)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        let mut conn = self.conn()?;
        row_list(&mut *conn, &self.table, prefix, false)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for CockroachBackend {
    fn run(&self, body: &mut TxnBody<'_>) -> Result<(), PhysicalError> {
        retry_on_abort(&self.retry, || {
            let mut conn = self.conn()?;
            let mut tx = conn.transaction().map_err(|e| classify(e, true))?;
            {
                let mut txn = CockroachTxn {
                    tx: &mut tx,
                    table: &self.table,
                };
                let handle: &mut dyn Txn = &mut txn;
                // On error `tx` is dropped here, which rolls it back.
                body(handle)?;
            }
            tx.commit().map_err(|e| classify(e, true))
        })
    }
}

struct CockroachTxn<'a, 'c> {
    tx: &'a mut postgres::Transaction<'c>,
    table: &'a str,
}

impl Txn for CockroachTxn<'_, '_> {
    fn get(&mut self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        row_get(&mut *self.tx, self.table, key, true)
    }

    fn put(&mut self, entry: &Entry) -> Result<(), PhysicalError> {
        row_put(&mut *self.tx, self.table, entry, true)
    }

    fn delete(&mut self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        row_delete(&mut *self.tx, self.table, key, true)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        row_list(&mut *self.tx, self.table, prefix, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CockroachConfig::new("postgresql://root@localhost:26257/?sslmode=disable");
        assert_eq!(config.table, "vault_kv_store");
        assert_eq!(config.max_parallel, 128);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn invalid_table_is_rejected_before_connecting() {
        let mut config = CockroachConfig::new("postgresql://root@127.0.0.1:1/?sslmode=disable");
        config.table = "kv; DROP TABLE users".to_string();
        let err = CockroachBackend::new(config).unwrap_err();
        assert!(matches!(err, PhysicalError::Config(_)));
    }

    #[test]
    fn malformed_url_is_a_config_error() {
        let config = CockroachConfig::new("postgresql://root@host:notaport/");
        let err = CockroachBackend::new(config).unwrap_err();
        assert!(matches!(err, PhysicalError::Config(_)));
    }

    #[test]
    fn unreachable_cluster_is_unavailable() {
        let mut config = CockroachConfig::new("postgresql://root@127.0.0.1:1/?sslmode=disable");
        config.connect_timeout = Duration::from_millis(200);
        let err = CockroachBackend::new(config).unwrap_err();
        assert!(matches!(err, PhysicalError::Unavailable(_)));
    }

    fn state(code: &SqlState, in_txn: bool) -> PhysicalError {
        classify_state(Some(code), false, in_txn, code.code().to_string())
    }

    #[test]
    fn sqlstates_map_onto_error_kinds() {
        assert!(matches!(
            state(&SqlState::T_R_SERIALIZATION_FAILURE, true),
            PhysicalError::TransactionAborted(_)
        ));
        assert!(matches!(
            state(&SqlState::T_R_SERIALIZATION_FAILURE, false),
            PhysicalError::WriteConflict(_)
        ));
        assert!(matches!(state(&SqlState::QUERY_CANCELED, true), PhysicalError::Timeout(_)));
        assert!(matches!(state(&SqlState::ADMIN_SHUTDOWN, false), PhysicalError::Unavailable(_)));
        assert!(matches!(state(&SqlState::UNDEFINED_TABLE, false), PhysicalError::Storage(_)));
    }

    #[test]
    fn codeless_errors_are_unavailable_only_when_connection_is_lost() {
        assert!(matches!(
            classify_state(None, true, true, "connection closed".into()),
            PhysicalError::Unavailable(_)
        ));
        let err = classify_state(None, false, true, "error serializing parameter 0".into());
        assert!(matches!(err, PhysicalError::Storage(_)));
        assert!(!err.is_retryable());
    }
}
