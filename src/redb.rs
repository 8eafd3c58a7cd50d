use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, Table, TableDefinition};
use tracing::debug;

use crate::entry::Entry;
use crate::error::PhysicalError;
use crate::path;
use crate::sql::validate_table;
use crate::traits::{Backend, Transactional, Txn, TxnBody};

pub const DEFAULT_TABLE: &str = "vault_kv_store";

type KvTable<'t> = Table<'t, &'static str, &'static [u8]>;

/// RedbBackend is a Backend implementation backed by redb — a pure-Rust
/// embedded key-value database.
///
/// redb admits one write transaction at a time, so batches are serializable
/// without ever aborting.
pub struct RedbBackend {
    db: Arc<Database>,
    table: String,
}

fn storage_err(e: impl std::fmt::Display) -> PhysicalError {
    PhysicalError::Storage(e.to_string())
}

impl RedbBackend {
    /// Open or create a redb database at the given path, using `table` as
    /// the namespace for entries.
    pub fn open(path: &Path, table: &str) -> Result<Self, PhysicalError> {
        let table = validate_table(table)?;
        let db = Database::create(path).map_err(|e| PhysicalError::Unavailable(e.to_string()))?;
        let backend = Self {
            db: Arc::new(db),
            table: table.to_string(),
        };

        // Ensure the table exists by doing a write transaction.
        let write_txn = backend
            .db
            .begin_write()
            .map_err(|e| PhysicalError::Schema(e.to_string()))?;
        {
            let _table = write_txn
                .open_table(backend.definition())
                .map_err(|e| PhysicalError::Schema(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| PhysicalError::Schema(e.to_string()))?;

        debug!("redb backend opened at {:?}, table {}", path, table);
        Ok(backend)
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    /// Drop every entry in the table.
    pub fn truncate(&self) -> Result<(), PhysicalError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        write_txn
            .delete_table(self.definition())
            .map_err(storage_err)?;
        {
            let _table = write_txn
                .open_table(self.definition())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Run `f` against the table inside one write transaction, committing
    /// only if `f` succeeds.
    fn with_write<F>(&self, f: F) -> Result<(), PhysicalError>
    where
        F: FnOnce(&mut KvTable<'_>) -> Result<(), PhysicalError>,
    {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn
                .open_table(self.definition())
                .map_err(storage_err)?;
            f(&mut table)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

fn table_get(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Entry>, PhysicalError> {
    match table.get(key) {
        Ok(Some(val)) => Ok(Some(Entry::new(key, val.value().to_vec()))),
        Ok(None) => Ok(None),
        Err(e) => Err(storage_err(e)),
    }
}

fn table_list(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>, PhysicalError> {
    let mut keys = Vec::new();
    let iter = table.range(prefix..).map_err(storage_err)?;
    for entry in iter {
        let entry = entry.map_err(storage_err)?;
        let key = entry.0.value().to_string();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key);
    }
    Ok(path::children(keys, prefix))
}

impl Backend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get(&self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn
            .open_table(self.definition())
            .map_err(storage_err)?;
        table_get(&table, key)
    }

    fn put(&self, entry: &Entry) -> Result<(), PhysicalError> {
        let key = path::normalize(&entry.key)?;
        self.with_write(|table| {
            table
                .insert(key, entry.value.as_slice())
                .map_err(storage_err)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        self.with_write(|table| {
            table.remove(key).map_err(storage_err)?;
            Ok(())
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn
            .open_table(self.definition())
            .map_err(storage_err)?;
        table_list(&table, prefix)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for RedbBackend {
    fn run(&self, body: &mut TxnBody<'_>) -> Result<(), PhysicalError> {
        // Dropping an uncommitted write transaction aborts it.
        self.with_write(|table| {
            let mut txn = RedbTxn { table };
            let handle: &mut dyn Txn = &mut txn;
            body(handle)
        })
    }
}

struct RedbTxn<'a, 't> {
    table: &'a mut KvTable<'t>,
}

impl Txn for RedbTxn<'_, '_> {
    fn get(&mut self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        table_get(&*self.table, key)
    }

    fn put(&mut self, entry: &Entry) -> Result<(), PhysicalError> {
        let key = path::normalize(&entry.key)?;
        self.table
            .insert(key, entry.value.as_slice())
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        self.table.remove(key).map_err(storage_err)?;
        Ok(())
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        table_list(&*self.table, prefix)
    }
}
