/// Entry is the unit of storage: an opaque byte value under a path key.
///
/// Keys are `/`-delimited paths such as `sys/config` or
/// `logical/4f1c/creds/db`. A trailing `/` names a folder; folders are only
/// ever derived from the keys beneath them during listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A single step of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put(Entry),
    Delete(String),
}

impl Operation {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put(Entry::new(key, value))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Operation::Delete(key.into())
    }

    /// The key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            Operation::Put(entry) => &entry.key,
            Operation::Delete(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_key() {
        assert_eq!(Operation::put("a/b", b"1".to_vec()).key(), "a/b");
        assert_eq!(Operation::delete("c").key(), "c");
    }
}
