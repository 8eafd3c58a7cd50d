use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::Entry;
use crate::error::PhysicalError;
use crate::path;
use crate::traits::{Backend, Transactional, Txn, TxnBody};

/// MemoryBackend keeps every entry in a process-local ordered map.
///
/// Transactions hold the write lock for their whole body, so they are
/// trivially serializable and never abort. Useful for tests and as the
/// reference behavior the other engines are checked against.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry.
    pub fn truncate(&self) -> Result<(), PhysicalError> {
        self.write()?.clear();
        Ok(())
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize, PhysicalError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, PhysicalError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>, PhysicalError> {
        self.data
            .read()
            .map_err(|e| PhysicalError::Storage(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>, PhysicalError> {
        self.data
            .write()
            .map_err(|e| PhysicalError::Storage(e.to_string()))
    }
}

fn scan_keys<'a>(
    data: &'a BTreeMap<String, Vec<u8>>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a String> + 'a {
    data.range(prefix.to_string()..)
        .map(|(key, _)| key)
        .take_while(move |key| key.starts_with(prefix))
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "inmem"
    }

    fn get(&self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        let data = self.read()?;
        Ok(data.get(key).map(|value| Entry::new(key, value.clone())))
    }

    fn put(&self, entry: &Entry) -> Result<(), PhysicalError> {
        let key = path::normalize(&entry.key)?;
        self.write()?.insert(key.to_string(), entry.value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        self.write()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        let data = self.read()?;
        Ok(path::children(scan_keys(&data, prefix), prefix))
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for MemoryBackend {
    fn run(&self, body: &mut TxnBody<'_>) -> Result<(), PhysicalError> {
        let mut data = self.write()?;
        let mut txn = MemoryTxn {
            base: &*data,
            writes: BTreeMap::new(),
        };
        let handle: &mut dyn Txn = &mut txn;
        body(handle)?;

        // Body succeeded: publish the staged writes while still holding the lock.
        let writes = txn.writes;
        for (key, value) in writes {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Staged writes on top of a locked snapshot. `None` marks a delete.
struct MemoryTxn<'a> {
    base: &'a BTreeMap<String, Vec<u8>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl Txn for MemoryTxn<'_> {
    fn get(&mut self, key: &str) -> Result<Option<Entry>, PhysicalError> {
        let key = path::normalize(key)?;
        let value = match self.writes.get(key) {
            Some(staged) => staged.clone(),
            None => self.base.get(key).cloned(),
        };
        Ok(value.map(|value| Entry::new(key, value)))
    }

    fn put(&mut self, entry: &Entry) -> Result<(), PhysicalError> {
        let key = path::normalize(&entry.key)?;
        self.writes
            .insert(key.to_string(), Some(entry.value.clone()));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), PhysicalError> {
        let key = path::normalize(key)?;
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, PhysicalError> {
        let mut live: Vec<&str> = scan_keys(self.base, prefix)
            .filter(|key| !self.writes.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        for (key, value) in &self.writes {
            if value.is_some() && key.starts_with(prefix) {
                live.push(key);
            }
        }
        Ok(path::children(live, prefix))
    }
}
