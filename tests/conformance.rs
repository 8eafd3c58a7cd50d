mod common;

use std::sync::Arc;
use std::time::Duration;

use openerp_physical::conformance::{exercise_backend, exercise_list_prefix, exercise_transactional};
use openerp_physical::{
    Backend, BackendConfig, BackendKind, CockroachBackend, CockroachConfig, MemoryBackend,
    Operation, RedbBackend, RetryPolicy, SqliteBackend, harness, new_backend,
};

#[test]
fn memory_backend() {
    common::init_test_tracing();
    let b = MemoryBackend::new();

    exercise_backend(&b);
    b.truncate().unwrap();
    exercise_list_prefix(&b);
    b.truncate().unwrap();
    exercise_transactional(&b);
}

#[test]
fn redb_backend() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let b = RedbBackend::open(&dir.path().join("conformance.redb"), "vault_kv_store").unwrap();

    exercise_backend(&b);
    b.truncate().unwrap();
    exercise_list_prefix(&b);
    b.truncate().unwrap();
    exercise_transactional(&b);
}

#[test]
fn sqlite_backend() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let b = SqliteBackend::open(
        &dir.path().join("conformance.sqlite"),
        "vault_kv_store",
        Duration::from_secs(5),
        RetryPolicy::default(),
    )
    .unwrap();

    exercise_backend(&b);
    b.truncate().unwrap();
    exercise_list_prefix(&b);
    b.truncate().unwrap();
    exercise_transactional(&b);
}

#[test]
fn phases_are_order_insensitive() {
    common::init_test_tracing();
    let b = MemoryBackend::new();

    exercise_transactional(&b);
    b.truncate().unwrap();
    exercise_list_prefix(&b);
    b.truncate().unwrap();
    exercise_backend(&b);
}

#[test]
fn factory_backends_through_trait_objects() {
    common::init_test_tracing();
    let backend: Arc<dyn Backend> = new_backend(&BackendConfig::new(BackendKind::InMemory)).unwrap();
    exercise_backend(backend.as_ref());

    // Callers discover batch support at runtime.
    let txn = backend.as_transactional().expect("inmem is transactional");
    txn.transact(&[Operation::put("foo/bar", b"1".to_vec()), Operation::put("foo/baz", b"2".to_vec())])
        .unwrap();
    let mut children = backend.list("foo/").unwrap();
    children.sort();
    assert_eq!(children, vec!["bar", "baz"]);
    assert_eq!(backend.get("foo/bar").unwrap().unwrap().value, b"1");
}

#[test]
fn cockroachdb_backend() {
    common::init_test_tracing();
    let Some(target) = harness::provision() else {
        eprintln!("skipping cockroachdb conformance: set CR_URL or start docker");
        return;
    };

    let mut config = CockroachConfig::new(target.url.clone());
    config.table = target.table.clone();
    let b = CockroachBackend::new(config).unwrap();

    // Start from an empty table even when CR_URL points at a shared one.
    b.truncate().unwrap();
    exercise_backend(&b);
    b.truncate().unwrap();
    exercise_list_prefix(&b);
    b.truncate().unwrap();
    exercise_transactional(&b);
    b.truncate().unwrap();
}

#[test]
fn cockroachdb_foreign_schema_is_reported() {
    common::init_test_tracing();
    let Some(target) = harness::provision() else {
        eprintln!("skipping cockroachdb schema check: set CR_URL or start docker");
        return;
    };

    let table = format!("{}_foreign", target.table);
    let mut client = postgres::Client::connect(&target.url, postgres::NoTls).unwrap();
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (path STRING PRIMARY KEY, value INT8);
             INSERT INTO {table} (path, value) VALUES ('k', 1);"
        ))
        .unwrap();

    let mut config = CockroachConfig::new(target.url.clone());
    config.table = table.clone();
    let b = CockroachBackend::new(config).unwrap();
    let err = b.get("k").unwrap_err();
    assert!(matches!(err, openerp_physical::PhysicalError::Schema(_)), "{err:?}");

    client.batch_execute(&format!("DROP TABLE {table}")).unwrap();
}
