//! Path helpers shared by every backend.
//!
//! Storage engines keep entries as flat rows or flat keys. Listing has to
//! rebuild the one-level hierarchy from those flat keys, and that
//! reconstruction lives here so it can be tested without a store.

use std::collections::BTreeSet;

use crate::error::PhysicalError;

pub const SEPARATOR: char = '/';

/// Validate a key before it reaches a backend.
///
/// Rejects the empty key and keys made only of separators. Redundant
/// separators are kept as-is: `a//b` and `a/b` are different keys.
pub fn normalize(key: &str) -> Result<&str, PhysicalError> {
    if key.chars().all(|c| c == SEPARATOR) {
        return Err(PhysicalError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

/// Whether `key` lies strictly beneath `prefix`.
pub fn is_child_of(key: &str, prefix: &str) -> bool {
    key.len() > prefix.len() && key.starts_with(prefix)
}

/// The segment of `key` one level below `prefix`.
///
/// `immediate_child("foo/bar", "foo/")` is `bar`;
/// `immediate_child("foo/bar/baz", "foo/")` is the folder `bar/`.
pub fn immediate_child<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    if !is_child_of(key, prefix) {
        return None;
    }
    let rest = &key[prefix.len()..];
    match rest.find(SEPARATOR) {
        Some(idx) => Some(&rest[..=idx]),
        None => Some(rest),
    }
}

/// Reduce flat stored keys to the sorted, de-duplicated immediate children
/// of `prefix`. Keys outside `prefix` are ignored.
pub fn children<I, S>(keys: I, prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    for key in keys {
        if let Some(child) = immediate_child(key.as_ref(), prefix) {
            if !seen.contains(child) {
                seen.insert(child.to_string());
            }
        }
    }
    seen.into_iter().collect()
}
