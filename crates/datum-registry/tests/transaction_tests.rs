//! Transaction, savepoint and registry lifecycle tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use datum_core::{DimensionConfig, Error, ErrorKind, MemoryDatabase, MemoryStore};
use datum_registry::{CollectionType, Registry, RegistryConfig};
use datum_test_utils::{assert_error_kind, init_test_logging, TestContext};

#[test]
fn test_failed_savepoint_keeps_outer_work() {
    init_test_logging();
    let ctx = TestContext::new();
    let registry = &ctx.registry;

    registry
        .transaction(false, || {
            registry.register_run("kept", None, None)?;
            let inner = registry.transaction(true, || {
                registry.register_run("dropped", None, None)?;
                Err::<(), _>(Error::InvalidInput("abandon".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

    assert!(registry.get_collection("kept").is_ok());
    assert_error_kind(registry.get_collection("dropped"), ErrorKind::NotFound);
}

#[test]
fn test_failed_transaction_rolls_back_everything() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;

    let result = registry.transaction(false, || {
        registry.register_run("a", None, None)?;
        registry.register_collection("b", CollectionType::Tagged, None)?;
        // Conflicts with the run registered above.
        registry.register_collection("a", CollectionType::Tagged, None)
    });
    assert_error_kind(result, ErrorKind::Conflict);
    assert_error_kind(registry.get_collection("a"), ErrorKind::NotFound);
    assert_error_kind(registry.get_collection("b"), ErrorKind::NotFound);
}

#[test]
fn test_uncommitted_work_is_invisible_to_other_connections() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;
    let reader = ctx.read_only();

    registry
        .transaction(false, || {
            registry.register_run("pending", None, None)?;
            assert!(registry.get_collection("pending").is_ok());
            assert_error_kind(reader.get_collection("pending"), ErrorKind::NotFound);
            Ok(())
        })
        .unwrap();
    assert!(reader.get_collection("pending").is_ok());
}

#[test]
fn test_create_over_existing_registry() {
    let store = MemoryStore::new();
    let config = DimensionConfig::standard().unwrap();
    let first = Registry::create(Arc::new(store.connect(true)), &config).unwrap();
    first.register_run("run", None, None).unwrap();

    // Same configuration: opens the existing registry.
    let again = Registry::create(Arc::new(store.connect(true)), &config).unwrap();
    assert!(again.get_run("run").is_ok());

    let mut changed = config.clone();
    changed.version += 100;
    assert_error_kind(
        Registry::create(Arc::new(store.connect(true)), &changed),
        ErrorKind::Conflict,
    );
}

#[test]
fn test_open_requires_an_initialized_database() {
    assert_error_kind(
        Registry::open(Arc::new(MemoryDatabase::new())),
        ErrorKind::NotFound,
    );

    let store = MemoryStore::new();
    let read_only = RegistryConfig {
        writeable: false,
        ..RegistryConfig::default()
    };
    assert_error_kind(Registry::connect(&store, &read_only), ErrorKind::NotFound);

    let registry = Registry::connect(&store, &RegistryConfig::default()).unwrap();
    assert!(registry.is_writeable());
    let reader = Registry::connect(&store, &read_only).unwrap();
    assert!(!reader.is_writeable());
    assert_eq!(reader.universe().version(), registry.universe().version());
}

#[test]
fn test_read_only_registry_rejects_writes() {
    let ctx = TestContext::with_base_data();
    let reader = ctx.read_only();
    assert_error_kind(reader.register_run("new", None, None), ErrorKind::Invalid);
    assert_error_kind(
        reader.insert_dimension_data(&datum_test_utils::base_records(reader.universe()), true),
        ErrorKind::Invalid,
    );
    // Syncing records that already exist writes nothing.
    for record in datum_test_utils::base_records(reader.universe()) {
        assert_eq!(
            reader.sync_dimension_data(&record, false).unwrap(),
            datum_registry::SyncOutcome::Unchanged
        );
    }
}
