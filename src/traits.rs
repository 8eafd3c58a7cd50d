use crate::entry::{Entry, Operation};
use crate::error::PhysicalError;

/// Backend is the contract every storage engine provides.
///
/// Keys are `/`-delimited paths (`sys/config`, `logical/4f1c/creds/db`) and
/// values are opaque bytes. A handle is shared by all callers, so engines
/// must be safe to use from many threads at once.
pub trait Backend: Send + Sync {
    /// Short engine identifier used in logs.
    fn name(&self) -> &'static str;

    /// Get the entry for a key. Returns None if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Entry>, PhysicalError>;

    /// Insert or overwrite an entry.
    fn put(&self, entry: &Entry) -> Result<(), PhysicalError>;

    /// Delete a key. No-op if the key does not exist.
    fn delete(&self, key: &str) -> Result<(), PhysicalError>;

    /// List the immediate children of `prefix`. Folders end with `/`.
    /// Returns an empty list when nothing is stored beneath `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, PhysicalError>;

    /// Capability check for atomic batches. Engines that cannot provide
    /// them keep the default.
    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }
}

/// The view of the store inside one transaction.
pub trait Txn {
    fn get(&mut self, key: &str) -> Result<Option<Entry>, PhysicalError>;

    fn put(&mut self, entry: &Entry) -> Result<(), PhysicalError>;

    fn delete(&mut self, key: &str) -> Result<(), PhysicalError>;

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, PhysicalError>;
}

/// Body of a transaction. It may run several times if the store aborts it,
/// so it must derive every write from what it reads through the `Txn`.
pub type TxnBody<'a> = dyn FnMut(&mut dyn Txn) -> Result<(), PhysicalError> + 'a;

/// Transactional is the optional capability of applying several operations
/// as one serializable, all-or-nothing unit.
pub trait Transactional: Send + Sync {
    /// Run `body` inside a single store transaction and commit it.
    ///
    /// If the body returns an error nothing it wrote is kept. Serialization
    /// conflicts are retried by the engine before `TransactionAborted`
    /// reaches the caller.
    fn run(&self, body: &mut TxnBody<'_>) -> Result<(), PhysicalError>;

    /// Apply `ops` in order as one atomic batch. An empty batch is a no-op.
    fn transact(&self, ops: &[Operation]) -> Result<(), PhysicalError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.run(&mut |txn| apply(txn, ops))
    }
}

/// Replay a batch against an open transaction.
pub fn apply(txn: &mut dyn Txn, ops: &[Operation]) -> Result<(), PhysicalError> {
    for op in ops {
        match op {
            Operation::Put(entry) => txn.put(entry)?,
            Operation::Delete(key) => txn.delete(key)?,
        }
    }
    Ok(())
}
