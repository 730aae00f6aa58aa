//! Two writeable registries over one store.
//!
//! Each test opens a transaction on the first connection, commits a
//! conflicting change through the second, and checks that the first commit
//! fails instead of silently losing or corrupting state.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use datum_core::{DatasetId, ErrorKind};
use datum_registry::{ChainLink, CollectionQuery, CollectionType, Registry, RegistryConfig};
use datum_test_utils::{
    assert_error_kind, init_test_logging, load_datasets, span, ImportedCalibrations, TestContext,
};

fn two_writers() -> (TestContext, Registry, ImportedCalibrations) {
    init_test_logging();
    let ctx = TestContext::with_base_data();
    let loaded = load_datasets(&ctx.registry).unwrap();
    let other = Registry::connect(&ctx.store, &RegistryConfig::default()).unwrap();
    (ctx, other, loaded)
}

fn members(registry: &Registry, collection: &str) -> Vec<DatasetId> {
    let mut ids: Vec<DatasetId> = registry
        .query_dataset_associations(
            "bias",
            &CollectionQuery {
                patterns: vec![collection.into()],
                ..CollectionQuery::default()
            },
        )
        .unwrap()
        .into_iter()
        .map(|a| a.dataset.id)
        .collect();
    ids.sort();
    ids
}

#[test]
fn test_concurrent_associate_of_same_data_id_conflicts() {
    let (ctx, other, loaded) = two_writers();
    let registry = &ctx.registry;
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();

    // Both biases are for detector 2.
    let result = registry.transaction(false, || {
        registry.associate("tagged", &loaded.bias_g[1..2])?;
        other.associate("tagged", &loaded.bias_r[..1])
    });
    assert_error_kind(result, ErrorKind::Conflict);
    assert_eq!(members(registry, "tagged"), [loaded.bias_r[0].id]);

    // The same dataset from both sides is not a conflict once committed.
    registry.associate("tagged", &loaded.bias_r[..1]).unwrap();
    assert_eq!(members(&other, "tagged"), [loaded.bias_r[0].id]);
}

#[test]
fn test_concurrent_certify_overlap_conflicts() {
    let (ctx, other, loaded) = two_writers();
    let registry = &ctx.registry;
    registry
        .register_collection("calibs", CollectionType::Calibration, None)
        .unwrap();

    // Detectors 2 and 3 are in both batches with overlapping ranges.
    let result = registry.transaction(false, || {
        registry.certify("calibs", &loaded.bias_g, span(Some(2), Some(4)))?;
        other.certify("calibs", &loaded.bias_r, span(Some(3), Some(5)))
    });
    assert_error_kind(result, ErrorKind::Conflict);

    let mut expected: Vec<DatasetId> = loaded.bias_r.iter().map(|d| d.id).collect();
    expected.sort();
    assert_eq!(members(registry, "calibs"), expected);
}

#[test]
fn test_concurrent_chain_blocks_removal() {
    let (ctx, other, _) = two_writers();
    let registry = &ctx.registry;
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();
    registry
        .register_collection("chain", CollectionType::Chained, None)
        .unwrap();

    let result = registry.transaction(false, || {
        registry.remove_collection("tagged")?;
        other.set_collection_chain("chain", vec![ChainLink::new("tagged")], false)
    });
    assert_error_kind(result, ErrorKind::Conflict);

    assert!(registry.get_collection("tagged").is_ok());
    assert_eq!(
        registry.get_collection_chain("chain").unwrap(),
        [ChainLink::new("tagged")]
    );
}

#[test]
fn test_concurrent_removal_blocks_chain() {
    let (ctx, other, _) = two_writers();
    let registry = &ctx.registry;
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();
    registry
        .register_collection("chain", CollectionType::Chained, None)
        .unwrap();

    let result = other.transaction(false, || {
        other.set_collection_chain("chain", vec![ChainLink::new("tagged")], false)?;
        registry.remove_collection("tagged")
    });
    assert_error_kind(result, ErrorKind::Conflict);

    assert_error_kind(registry.get_collection("tagged"), ErrorKind::NotFound);
    assert!(registry.get_collection_chain("chain").unwrap().is_empty());
}
