//! Integration tests for collections, chains and dataset membership.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;

use datum_core::ErrorKind;
use datum_registry::{ChainLink, CollectionQuery, CollectionType, NamePattern};
use datum_test_utils::{
    assert_error_kind, assert_same_datasets, detector_id, init_test_logging, load_datasets,
    TestContext,
};

fn names(records: &[datum_registry::CollectionRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

#[test]
fn test_register_is_idempotent_per_type() {
    init_test_logging();
    let ctx = TestContext::new();
    let registry = &ctx.registry;

    assert!(registry
        .register_collection("tagged", CollectionType::Tagged, Some("hand-picked"))
        .unwrap());
    assert!(!registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap());
    assert_error_kind(
        registry.register_collection("tagged", CollectionType::Run, None),
        ErrorKind::Conflict,
    );
    assert_eq!(
        registry.get_collection_documentation("tagged").unwrap().as_deref(),
        Some("hand-picked")
    );
    registry.set_collection_documentation("tagged", None).unwrap();
    assert_eq!(registry.get_collection_documentation("tagged").unwrap(), None);
    assert_error_kind(registry.get_collection("missing"), ErrorKind::NotFound);
}

#[test]
fn test_run_metadata_is_recorded() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;
    let span = datum_test_utils::span(Some(1), Some(2));

    registry.register_run("run1", Some("node7"), Some(span)).unwrap();
    let run = registry.get_run("run1").unwrap();
    assert_eq!(run.host.as_deref(), Some("node7"));
    assert_eq!(run.timespan, Some(span));

    registry
        .register_collection("calibs", CollectionType::Calibration, None)
        .unwrap();
    assert_error_kind(registry.get_run("calibs"), ErrorKind::Invalid);
}

#[test]
fn test_read_only_registry_rejects_new_collections() {
    let ctx = TestContext::new();
    ctx.registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();

    let reader = ctx.read_only();
    assert!(!reader
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap());
    assert_error_kind(
        reader.register_collection("other", CollectionType::Tagged, None),
        ErrorKind::Invalid,
    );
}

#[test]
fn test_chain_search_order_and_restrictions() {
    let ctx = TestContext::with_base_data();
    let registry = &ctx.registry;
    let loaded = load_datasets(registry).unwrap();
    registry
        .register_collection("chain", CollectionType::Chained, None)
        .unwrap();
    registry
        .set_collection_chain(
            "chain",
            vec![
                ChainLink::restricted("imported_r", ["flat"]),
                ChainLink::new("imported_g"),
            ],
            false,
        )
        .unwrap();

    // The restricted link hides imported_r from bias searches.
    let found = registry
        .find_dataset("bias", &detector_id(2), &["chain".to_string()], None)
        .unwrap()
        .unwrap();
    assert_eq!(found.run, "imported_g");
    assert_eq!(found.id, loaded.bias_g[1].id);

    // Detector 4 only has a bias in imported_r.
    assert!(registry
        .find_dataset("bias", &detector_id(4), &["chain".to_string()], None)
        .unwrap()
        .is_none());

    registry
        .set_collection_chain(
            "chain",
            vec![ChainLink::new("imported_r"), ChainLink::new("imported_g")],
            false,
        )
        .unwrap();
    let found = registry
        .find_dataset("bias", &detector_id(2), &["chain".to_string()], None)
        .unwrap()
        .unwrap();
    assert_eq!(found.run, "imported_r");
    assert_eq!(
        registry.get_collection_parents("imported_r").unwrap(),
        BTreeSet::from(["chain".to_string()])
    );
}

#[test]
fn test_chain_cycles_are_rejected_and_old_chain_kept() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;
    registry.register_run("run", None, None).unwrap();
    for name in ["outer", "inner"] {
        registry
            .register_collection(name, CollectionType::Chained, None)
            .unwrap();
    }
    registry
        .set_collection_chain("outer", vec![ChainLink::new("inner")], false)
        .unwrap();
    registry
        .set_collection_chain("inner", vec![ChainLink::new("run")], false)
        .unwrap();

    assert_error_kind(
        registry.set_collection_chain(
            "inner",
            vec![ChainLink::new("run"), ChainLink::new("outer")],
            false,
        ),
        ErrorKind::Invalid,
    );
    assert_eq!(
        registry.get_collection_chain("inner").unwrap(),
        vec![ChainLink::new("run")]
    );
    assert_error_kind(
        registry.set_collection_chain("inner", vec![ChainLink::new("inner")], false),
        ErrorKind::Invalid,
    );
}

#[test]
fn test_flattened_chain_lists_leaves() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;
    for run in ["a", "b", "c"] {
        registry.register_run(run, None, None).unwrap();
    }
    for chain in ["ab", "all"] {
        registry
            .register_collection(chain, CollectionType::Chained, None)
            .unwrap();
    }
    registry
        .set_collection_chain("ab", vec![ChainLink::new("a"), ChainLink::new("b")], false)
        .unwrap();
    registry
        .set_collection_chain(
            "all",
            vec![ChainLink::new("ab"), ChainLink::new("c"), ChainLink::new("a")],
            true,
        )
        .unwrap();
    let children: Vec<String> = registry
        .get_collection_chain("all")
        .unwrap()
        .into_iter()
        .map(|l| l.child)
        .collect();
    assert_eq!(children, ["a", "b", "c"]);
}

#[test]
fn test_query_collections_by_pattern_and_type() {
    let ctx = TestContext::new();
    let registry = &ctx.registry;
    registry.register_run("raw/1", None, None).unwrap();
    registry.register_run("raw/2", None, None).unwrap();
    registry
        .register_collection("calib/current", CollectionType::Calibration, None)
        .unwrap();
    registry
        .register_collection("defaults", CollectionType::Chained, None)
        .unwrap();
    registry
        .set_collection_chain(
            "defaults",
            vec![ChainLink::new("calib/current"), ChainLink::new("raw/2")],
            false,
        )
        .unwrap();

    let raw = registry
        .query_collections(&CollectionQuery {
            patterns: vec![NamePattern::regex("raw/.*").unwrap()],
            ..CollectionQuery::default()
        })
        .unwrap();
    assert_eq!(names(&raw), ["raw/1", "raw/2"]);

    let runs = registry
        .query_collections(&CollectionQuery {
            types: Some(BTreeSet::from([CollectionType::Run])),
            ..CollectionQuery::default()
        })
        .unwrap();
    assert_eq!(names(&runs), ["raw/1", "raw/2"]);

    let flattened = registry
        .query_collections(&CollectionQuery {
            patterns: vec!["defaults".into()],
            flatten_chains: true,
            include_chains: true,
            ..CollectionQuery::default()
        })
        .unwrap();
    assert_eq!(names(&flattened), ["defaults", "calib/current", "raw/2"]);

    assert_error_kind(
        registry.query_collections(&CollectionQuery {
            patterns: vec!["nope".into()],
            ..CollectionQuery::default()
        }),
        ErrorKind::NotFound,
    );
}

#[test]
fn test_tagged_membership() {
    let ctx = TestContext::with_base_data();
    let registry = &ctx.registry;
    let loaded = load_datasets(registry).unwrap();
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();

    registry.associate("tagged", &loaded.bias_g).unwrap();
    // Re-associating the same datasets is a no-op.
    registry.associate("tagged", &loaded.bias_g).unwrap();
    // imported_r's detector 2 bias has the same data ID as imported_g's.
    assert_error_kind(
        registry.associate("tagged", &loaded.bias_r[..1]),
        ErrorKind::Conflict,
    );
    assert_error_kind(
        registry.associate("imported_g", &loaded.bias_r),
        ErrorKind::Invalid,
    );

    let associations = registry
        .query_dataset_associations(
            "bias",
            &CollectionQuery {
                patterns: vec!["tagged".into()],
                ..CollectionQuery::default()
            },
        )
        .unwrap();
    let tagged: Vec<_> = associations.into_iter().map(|a| a.dataset).collect();
    assert_same_datasets(&tagged, &loaded.bias_g);

    registry.disassociate("tagged", &loaded.bias_g[..1]).unwrap();
    let found = registry
        .find_dataset("bias", &detector_id(1), &["tagged".to_string()], None)
        .unwrap();
    assert!(found.is_none());
}

#[test]
fn test_removing_a_run_removes_its_datasets_everywhere() {
    let ctx = TestContext::with_base_data();
    let registry = &ctx.registry;
    let loaded = load_datasets(registry).unwrap();
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();
    registry.associate("tagged", &loaded.bias_g).unwrap();
    registry
        .register_collection("chain", CollectionType::Chained, None)
        .unwrap();
    registry
        .set_collection_chain("chain", vec![ChainLink::new("imported_g")], false)
        .unwrap();

    assert_error_kind(
        registry.remove_collection("imported_g"),
        ErrorKind::Conflict,
    );
    assert!(registry.get_dataset(loaded.bias_g[0].id).unwrap().is_some());

    registry.remove_collection("chain").unwrap();
    registry.remove_collection("imported_g").unwrap();
    assert!(registry.get_dataset(loaded.bias_g[0].id).unwrap().is_none());
    assert!(registry
        .find_dataset("bias", &detector_id(1), &["tagged".to_string()], None)
        .unwrap()
        .is_none());
    assert!(registry.get_dataset(loaded.bias_r[0].id).unwrap().is_some());
}

#[test]
fn test_duplicate_data_ids_in_one_run_are_rejected() {
    let ctx = TestContext::with_base_data();
    let registry = &ctx.registry;
    load_datasets(registry).unwrap();

    assert_error_kind(
        registry.insert_datasets("bias", &[detector_id(1)], "imported_g"),
        ErrorKind::Conflict,
    );
    registry
        .register_collection("tagged", CollectionType::Tagged, None)
        .unwrap();
    assert_error_kind(
        registry.insert_datasets("bias", &[detector_id(1)], "tagged"),
        ErrorKind::Invalid,
    );
    // Detector 9 has no record.
    assert_error_kind(
        registry.insert_datasets("bias", &[detector_id(9)], "imported_g"),
        ErrorKind::NotFound,
    );
}
