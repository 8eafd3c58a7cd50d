//! Behavioral checks every engine has to pass.
//!
//! These functions only talk to the [`Backend`] and [`Transactional`]
//! traits, so one suite certifies every engine. They panic on the first
//! violation, which makes them usable directly inside `#[test]` bodies.
//!
//! Each phase expects an empty store. Callers reset the store (for example
//! with the engine's `truncate`) between phases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::entry::{Entry, Operation};
use crate::traits::{Backend, Transactional};

fn value_of(b: &dyn Backend, key: &str) -> Option<Vec<u8>> {
    match b.get(key) {
        Ok(entry) => entry.map(|e| {
            assert_eq!(e.key, key, "{}: get returned a different key", b.name());
            e.value
        }),
        Err(e) => panic!("{}: get {:?} failed: {}", b.name(), key, e),
    }
}

fn put(b: &dyn Backend, key: &str, value: &[u8]) {
    if let Err(e) = b.put(&Entry::new(key, value.to_vec())) {
        panic!("{}: put {:?} failed: {}", b.name(), key, e);
    }
}

fn delete(b: &dyn Backend, key: &str) {
    if let Err(e) = b.delete(key) {
        panic!("{}: delete {:?} failed: {}", b.name(), key, e);
    }
}

fn list(b: &dyn Backend, prefix: &str) -> Vec<String> {
    match b.list(prefix) {
        Ok(mut keys) => {
            keys.sort();
            keys
        }
        Err(e) => panic!("{}: list {:?} failed: {}", b.name(), prefix, e),
    }
}

fn transactional(b: &dyn Backend) -> &dyn Transactional {
    match b.as_transactional() {
        Some(t) => t,
        None => panic!("{}: backend is not transactional", b.name()),
    }
}

/// Get/Put/Delete round trips and listing at several depths.
pub fn exercise_backend(b: &dyn Backend) {
    let name = b.name();

    assert!(list(b, "").is_empty(), "{name}: store should start empty");

    // Deleting a missing key is not an error.
    delete(b, "foo");
    assert_eq!(value_of(b, "foo"), None);

    put(b, "foo", b"test");
    assert_eq!(value_of(b, "foo").as_deref(), Some(&b"test"[..]));
    assert_eq!(list(b, ""), vec!["foo"]);

    delete(b, "foo");
    assert!(list(b, "").is_empty(), "{name}: list after delete");
    assert_eq!(value_of(b, "foo"), None);

    // Idempotent delete.
    delete(b, "foo");
    assert_eq!(value_of(b, "foo"), None);

    // Last write wins.
    put(b, "foo/test", b"one");
    put(b, "foo/test", b"two");
    assert_eq!(value_of(b, "foo/test").as_deref(), Some(&b"two"[..]));

    put(b, "foo/bar", b"baz");
    assert_eq!(list(b, ""), vec!["foo/"]);
    assert_eq!(list(b, "foo/"), vec!["bar", "test"]);

    // A deep entry shows up as a single folder one level down.
    put(b, "foo/nested1/nested2/nested3", b"deep");
    assert_eq!(list(b, "foo/"), vec!["bar", "nested1/", "test"]);
    assert_eq!(list(b, "foo/nested1/"), vec!["nested2/"]);

    // Removing it leaves no folder behind.
    delete(b, "foo/nested1/nested2/nested3");
    assert_eq!(list(b, "foo/"), vec!["bar", "test"]);
    assert!(list(b, "foo/nested1/").is_empty());

    // Deleting one child keeps the folder while others remain.
    put(b, "foo/zip", b"zap");
    delete(b, "foo/bar");
    assert_eq!(list(b, ""), vec!["foo/"]);
    assert_eq!(list(b, "foo/"), vec!["test", "zip"]);

    // Deleting the last children removes the folder.
    delete(b, "foo/test");
    delete(b, "foo/zip");
    assert!(list(b, "").is_empty(), "{name}: folder should vanish");
    assert!(list(b, "foo/").is_empty());

    // Values are opaque bytes.
    let binary: Vec<u8> = (0..=255u8).collect();
    put(b, "bin/all", &binary);
    assert_eq!(value_of(b, "bin/all"), Some(binary));

    put(b, "bin/empty", b"");
    assert_eq!(value_of(b, "bin/empty"), Some(Vec::new()));

    let large = vec![0xA5u8; 512 * 1024];
    put(b, "bin/large", &large);
    assert_eq!(value_of(b, "bin/large"), Some(large));

    assert_eq!(list(b, "bin/"), vec!["all", "empty", "large"]);
    for key in ["bin/all", "bin/empty", "bin/large"] {
        delete(b, key);
    }
    assert!(list(b, "").is_empty());

    // Keys made only of separators are rejected.
    assert!(b.get("").is_err(), "{name}: empty key accepted");
    assert!(
        b.put(&Entry::new("/", b"x".to_vec())).is_err(),
        "{name}: separator-only key accepted"
    );
}

/// Listing when a key and a folder share a name.
pub fn exercise_list_prefix(b: &dyn Backend) {
    put(b, "foo", b"test");
    put(b, "foo/bar", b"baz");
    put(b, "foo/bar/baz", b"baz");

    assert_eq!(list(b, ""), vec!["foo", "foo/"]);
    assert_eq!(list(b, "foo/"), vec!["bar", "bar/"]);
    assert_eq!(list(b, "foo/bar/"), vec!["baz"]);
    assert!(list(b, "foo/bar/baz/").is_empty());
    assert!(list(b, "missing/").is_empty());

    // Siblings with a shared folder collapse to one child.
    put(b, "a/b/c", b"1");
    put(b, "a/b/d", b"2");
    assert_eq!(list(b, "a/"), vec!["b/"]);
}

/// Atomic batches, rollback, and behavior under concurrency.
pub fn exercise_transactional(b: &dyn Backend) {
    let name = b.name();
    let t = transactional(b);

    put(b, "foo", b"bar");
    put(b, "zip", b"zap");
    put(b, "deleteme", b"1");
    put(b, "deleteme2", b"2");

    let ops = vec![
        Operation::delete("deleteme"),
        Operation::delete("deleteme2"),
        Operation::put("foo", b"bar2".to_vec()),
        Operation::put("zip", b"zap3".to_vec()),
        Operation::put("foo/bar", b"baz".to_vec()),
        Operation::put("foo/bar/baz", b"baz".to_vec()),
        // Missing keys delete cleanly inside a batch too.
        Operation::delete("never-existed"),
    ];
    if let Err(e) = t.transact(&ops) {
        panic!("{name}: transact failed: {e}");
    }

    assert_eq!(value_of(b, "deleteme"), None);
    assert_eq!(value_of(b, "deleteme2"), None);
    assert_eq!(value_of(b, "foo").as_deref(), Some(&b"bar2"[..]));
    assert_eq!(value_of(b, "zip").as_deref(), Some(&b"zap3"[..]));
    assert_eq!(list(b, ""), vec!["foo", "foo/", "zip"]);
    assert_eq!(list(b, "foo/"), vec!["bar", "bar/"]);

    // Operations apply in order: the later put wins.
    let ops = vec![
        Operation::put("order", b"first".to_vec()),
        Operation::delete("order"),
        Operation::put("order", b"last".to_vec()),
    ];
    t.transact(&ops).unwrap_or_else(|e| panic!("{name}: transact failed: {e}"));
    assert_eq!(value_of(b, "order").as_deref(), Some(&b"last"[..]));

    // Empty batch.
    t.transact(&[])
        .unwrap_or_else(|e| panic!("{name}: empty transact failed: {e}"));

    // A body that fails after writing keeps none of its writes.
    let result = t.run(&mut |txn| {
        txn.put(&Entry::new("ghost", b"boo".to_vec()))?;
        txn.delete("foo")?;
        Err(crate::PhysicalError::Storage("body failed".into()))
    });
    assert!(result.is_err(), "{name}: failing body reported success");
    assert_eq!(value_of(b, "ghost"), None);
    assert_eq!(value_of(b, "foo").as_deref(), Some(&b"bar2"[..]));

    // Reads inside a transaction see its own writes.
    t.run(&mut |txn| {
        txn.put(&Entry::new("own/write", b"1".to_vec()))?;
        let seen = txn.get("own/write")?.map(|e| e.value);
        assert_eq!(seen.as_deref(), Some(&b"1"[..]), "{name}: own write not visible");
        assert_eq!(txn.list("own/")?, vec!["write"]);
        Ok(())
    })
    .unwrap_or_else(|e| panic!("{name}: run failed: {e}"));

    exercise_concurrent_disjoint(b);
    exercise_atomic_visibility(b);
    exercise_counter(b);
}

/// Transactions on disjoint keys never fail each other.
fn exercise_concurrent_disjoint(b: &dyn Backend) {
    let name = b.name();
    let t = transactional(b);
    let workers = 4;
    let rounds = 10;

    thread::scope(|s| {
        for w in 0..workers {
            s.spawn(move || {
                for r in 0..rounds {
                    let ops = vec![
                        Operation::put(format!("disjoint/{w}/a"), r.to_string().into_bytes()),
                        Operation::put(format!("disjoint/{w}/b"), r.to_string().into_bytes()),
                    ];
                    t.transact(&ops)
                        .unwrap_or_else(|e| panic!("{name}: worker {w} failed: {e}"));
                }
            });
        }
    });

    let mut expected: Vec<String> = (0..workers).map(|w| format!("{w}/")).collect();
    expected.sort();
    assert_eq!(list(b, "disjoint/"), expected);
    let last = (rounds - 1).to_string().into_bytes();
    for w in 0..workers {
        assert_eq!(value_of(b, &format!("disjoint/{w}/a")), Some(last.clone()));
        assert_eq!(value_of(b, &format!("disjoint/{w}/b")), Some(last.clone()));
    }
}

/// A concurrent reader never sees `[Put(a), Delete(b)]` half applied.
fn exercise_atomic_visibility(b: &dyn Backend) {
    let name = b.name();
    let t = transactional(b);
    let done = AtomicBool::new(false);

    t.transact(&[Operation::put("atomic/b", b"present".to_vec())])
        .unwrap_or_else(|e| panic!("{name}: setup failed: {e}"));

    thread::scope(|s| {
        let done = &done;
        s.spawn(move || {
            while !done.load(Ordering::Acquire) {
                let mut snapshot = (None, None);
                t.run(&mut |txn| {
                    snapshot = (
                        txn.get("atomic/a")?.map(|e| e.value),
                        txn.get("atomic/b")?.map(|e| e.value),
                    );
                    Ok(())
                })
                .unwrap_or_else(|e| panic!("{name}: reader failed: {e}"));
                match snapshot {
                    (None, Some(_)) | (Some(_), None) => {}
                    other => panic!("{name}: observed partial batch: {other:?}"),
                }
            }
        });

        for _ in 0..20 {
            t.transact(&[
                Operation::put("atomic/a", b"1".to_vec()),
                Operation::delete("atomic/b"),
            ])
            .unwrap_or_else(|e| panic!("{name}: forward batch failed: {e}"));
            t.transact(&[
                Operation::delete("atomic/a"),
                Operation::put("atomic/b", b"present".to_vec()),
            ])
            .unwrap_or_else(|e| panic!("{name}: reverse batch failed: {e}"));
        }
        done.store(true, Ordering::Release);
    });
}

/// Read-modify-write increments from concurrent transactions are never lost.
fn exercise_counter(b: &dyn Backend) {
    let name = b.name();
    let t = transactional(b);
    let workers = 2;
    let increments = 5;

    put(b, "counter", b"0");

    thread::scope(|s| {
        for w in 0..workers {
            s.spawn(move || {
                for _ in 0..increments {
                    t.run(&mut |txn| {
                        let current = match txn.get("counter")? {
                            Some(entry) => String::from_utf8_lossy(&entry.value)
                                .parse::<u64>()
                                .unwrap_or_else(|e| panic!("{name}: bad counter: {e}")),
                            None => 0,
                        };
                        txn.put(&Entry::new("counter", (current + 1).to_string().into_bytes()))
                    })
                    .unwrap_or_else(|e| panic!("{name}: increment by worker {w} failed: {e}"));
                }
            });
        }
    });

    let expected = (workers * increments).to_string().into_bytes();
    assert_eq!(
        value_of(b, "counter"),
        Some(expected),
        "{name}: lost update on counter"
    );
}
