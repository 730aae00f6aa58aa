//! Integration tests for dimension and dataset queries.
//!
//! Fixture geometry: visit 1 and its detector regions lie inside patch 0,
//! visit 2 and its detector regions inside patch 2. Exposures 100 and 101
//! cover hours 1 to 3, exposures 110 and 111 hours 5 to 7.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use datum_core::{
    DataCoordinate, DataIdValue, Database, DatasetId, ErrorKind, Timespan, Value,
};
use datum_registry::{CollectionType, DatasetSearch, QueryOptions, QueryRow};
use datum_test_utils::{
    assert_error_kind, assert_same_data_ids, assert_same_datasets, data_id, detector_id,
    init_test_logging, load_datasets, load_observations, span, ImportedCalibrations, TestContext,
    INSTRUMENT, PIXEL_BASE, SKYMAP,
};

fn observation_context() -> TestContext {
    init_test_logging();
    let ctx = TestContext::with_base_data();
    load_observations(&ctx.registry).unwrap();
    ctx
}

fn dataset_context() -> (TestContext, ImportedCalibrations) {
    let ctx = observation_context();
    let loaded = load_datasets(&ctx.registry).unwrap();
    (ctx, loaded)
}

fn visit_id(visit: i64) -> DataCoordinate {
    data_id(&[("instrument", INSTRUMENT.into()), ("visit", visit.into())])
}

fn where_clause(text: &str) -> QueryOptions {
    QueryOptions {
        where_clause: Some(text.to_string()),
        ..QueryOptions::default()
    }
}

fn in_collections(collections: &[&str]) -> QueryOptions {
    QueryOptions {
        collections: collections.iter().map(ToString::to_string).collect(),
        ..QueryOptions::default()
    }
}

type SortableRow = (
    BTreeMap<String, DataIdValue>,
    Vec<(DatasetId, String, Option<Timespan>)>,
);

fn sortable(rows: Vec<QueryRow>) -> Vec<SortableRow> {
    let mut out: Vec<SortableRow> = rows
        .into_iter()
        .map(|r| {
            let hits = r
                .datasets
                .into_iter()
                .map(|h| (h.id, h.collection, h.validity))
                .collect();
            (r.values, hits)
        })
        .collect();
    out.sort();
    out
}

#[test]
fn test_single_dimension_query() {
    let ctx = observation_context();
    let detectors = ctx
        .registry
        .query_data_ids(&["detector"], &QueryOptions::default())
        .unwrap();
    assert_same_data_ids(&detectors, &(1..=4).map(detector_id).collect::<Vec<_>>());

    let constrained = ctx
        .registry
        .query_data_ids(
            &["detector"],
            &QueryOptions {
                data_id: Some(detector_id(3)),
                ..QueryOptions::default()
            },
        )
        .unwrap();
    assert_same_data_ids(&constrained, &[detector_id(3)]);
}

#[test]
fn test_implied_dimensions_are_joined_through_records() {
    let ctx = observation_context();
    let visits = ctx
        .registry
        .query_data_ids(&["visit"], &where_clause("band = 'g'"))
        .unwrap();
    assert_same_data_ids(&visits, &[visit_id(1)]);

    // Exposures join visits through the always-joined visit_definition.
    let pairs = ctx
        .registry
        .query_data_ids(&["exposure", "visit"], &where_clause("visit = 2"))
        .unwrap();
    let exposures: Vec<i64> = pairs
        .iter()
        .map(|d| d.get("exposure").and_then(DataIdValue::as_int).unwrap())
        .collect();
    assert_eq!(exposures, [110, 111]);
}

#[test]
fn test_record_field_predicates() {
    let ctx = observation_context();
    let registry = &ctx.registry;

    let wavefront = registry
        .query_data_ids(&["detector"], &where_clause("detector.purpose = 'WAVEFRONT'"))
        .unwrap();
    assert_same_data_ids(&wavefront, &[detector_id(4)]);

    let good_seeing = registry
        .query_data_ids(&["visit"], &where_clause("visit.seeing < 1.0"))
        .unwrap();
    assert_same_data_ids(&good_seeing, &[visit_id(1)]);

    let combined = registry
        .query_data_ids(
            &["detector"],
            &where_clause("detector IN (1, 2, 4) AND NOT detector.purpose = 'WAVEFRONT'"),
        )
        .unwrap();
    assert_same_data_ids(&combined, &[detector_id(1), detector_id(2)]);

    assert_error_kind(
        registry.query_data_ids(&["detector"], &where_clause("detector.nonsense = 1")),
        ErrorKind::Invalid,
    );
    assert_error_kind(
        registry.query_data_ids(&["detector"], &where_clause("detector = ")),
        ErrorKind::Invalid,
    );
}

#[test]
fn test_dimension_records_query() {
    let ctx = observation_context();
    let records = ctx
        .registry
        .query_dimension_records("detector", &where_clause("detector.raft = 'A'"))
        .unwrap();
    let mut names: Vec<String> = records
        .iter()
        .filter_map(|r| r.get("full_name").and_then(Value::as_str).map(str::to_string))
        .collect();
    names.sort();
    assert_eq!(names, ["Aa", "Ab"]);
}

#[test]
fn test_spatial_join_between_families() {
    let ctx = observation_context();
    let visits_and_patches = ctx
        .registry
        .query_data_ids(&["visit", "patch"], &QueryOptions::default())
        .unwrap();
    let expected = [(1, 0), (2, 2)].map(|(visit, patch): (i64, i64)| {
        data_id(&[
            ("instrument", INSTRUMENT.into()),
            ("visit", visit.into()),
            ("skymap", SKYMAP.into()),
            ("tract", 0.into()),
            ("patch", patch.into()),
        ])
    });
    assert_same_data_ids(&visits_and_patches, &expected);

    // With detectors, the finer visit_detector_region regions are used.
    let rows = ctx
        .registry
        .query_data_ids(&["visit", "detector", "patch"], &QueryOptions::default())
        .unwrap();
    assert_eq!(rows.len(), 8);
    for row in &rows {
        let visit = row.get("visit").and_then(DataIdValue::as_int).unwrap();
        let patch = row.get("patch").and_then(DataIdValue::as_int).unwrap();
        assert_eq!(patch, if visit == 1 { 0 } else { 2 });
    }
}

#[test]
fn test_skypix_dimensions_are_enumerated_from_regions() {
    let ctx = observation_context();
    let constraint = data_id(&[
        ("instrument", INSTRUMENT.into()),
        ("visit", 1.into()),
        ("detector", 1.into()),
    ]);
    let options = QueryOptions {
        data_id: Some(constraint),
        ..QueryOptions::default()
    };

    // The detector region covers five htm7 pixels from the base.
    let fine = ctx.registry.query_data_ids(&["htm7"], &options).unwrap();
    let expected: Vec<DataCoordinate> = (PIXEL_BASE..PIXEL_BASE + 5)
        .map(|p| data_id(&[("htm7", DataIdValue::try_from(p).unwrap())]))
        .collect();
    assert_same_data_ids(&fine, &expected);

    // At level 6 those pixels have two parents.
    let coarse = ctx.registry.query_data_ids(&["htm6"], &options).unwrap();
    let parent = PIXEL_BASE >> 2;
    let expected: Vec<DataCoordinate> = [parent, parent + 1]
        .into_iter()
        .map(|p| data_id(&[("htm6", DataIdValue::try_from(p).unwrap())]))
        .collect();
    assert_same_data_ids(&coarse, &expected);

    // An explicit pixel value needs no region.
    let given = ctx
        .registry
        .query_data_ids(
            &["htm7"],
            &QueryOptions {
                data_id: Some(expected_pixel(PIXEL_BASE + 3)),
                ..QueryOptions::default()
            },
        )
        .unwrap();
    assert_same_data_ids(&given, &[expected_pixel(PIXEL_BASE + 3)]);
}

fn expected_pixel(pixel: u64) -> DataCoordinate {
    data_id(&[("htm7", DataIdValue::try_from(pixel).unwrap())])
}

#[test]
fn test_dataset_query_in_runs() {
    let (ctx, loaded) = dataset_context();
    let registry = &ctx.registry;

    let in_g = registry
        .query_datasets("bias", &["detector"], &in_collections(&["imported_g"]))
        .unwrap();
    assert_same_datasets(&in_g, &loaded.bias_g);

    let everywhere = registry
        .query_datasets(
            "bias",
            &["detector"],
            &in_collections(&["imported_r", "imported_g"]),
        )
        .unwrap();
    assert_same_datasets(&everywhere, &loaded.bias());

    let first = registry
        .query_datasets(
            "bias",
            &["detector"],
            &QueryOptions {
                find_first: true,
                ..in_collections(&["imported_r", "imported_g"])
            },
        )
        .unwrap();
    let mut expected = vec![loaded.bias_g[0].clone()];
    expected.extend(loaded.bias_r.iter().cloned());
    assert_same_datasets(&first, &expected);

    // Only filters with a flat are returned when flats are required.
    let with_flats = registry
        .query_data_ids(
            &["detector"],
            &QueryOptions {
                datasets: vec!["flat".to_string()],
                ..in_collections(&["imported_g"])
            },
        )
        .unwrap();
    assert_same_data_ids(&with_flats, &[detector_id(2), detector_id(3)]);

    assert_error_kind(
        registry.query_datasets("bias", &["detector"], &QueryOptions::default()),
        ErrorKind::Invalid,
    );
}

#[test]
fn test_calibration_query_uses_row_timespans() {
    let (ctx, loaded) = dataset_context();
    let registry = &ctx.registry;
    registry
        .register_collection("calibs", CollectionType::Calibration, None)
        .unwrap();
    registry
        .certify("calibs", &loaded.bias_g, span(None, Some(4)))
        .unwrap();
    registry
        .certify("calibs", &loaded.bias_r, span(Some(4), None))
        .unwrap();

    let by_exposure = registry
        .query_datasets(
            "bias",
            &["exposure"],
            &QueryOptions {
                find_first: true,
                ..in_collections(&["calibs"])
            },
        )
        .unwrap();
    assert_same_datasets(&by_exposure, &loaded.bias());

    let early = registry
        .query_data_ids(
            &["exposure", "detector"],
            &QueryOptions {
                datasets: vec!["bias".to_string()],
                where_clause: Some("exposure = 100".to_string()),
                ..in_collections(&["calibs"])
            },
        )
        .unwrap();
    let detectors: Vec<i64> = early
        .iter()
        .map(|d| d.get("detector").and_then(DataIdValue::as_int).unwrap())
        .collect();
    assert_eq!(detectors, [1, 2, 3]);

    let explicit = registry
        .query_datasets(
            "bias",
            &["detector"],
            &QueryOptions {
                timespan: Some(span(Some(1), Some(2))),
                ..in_collections(&["calibs"])
            },
        )
        .unwrap();
    assert_same_datasets(&explicit, &loaded.bias_g);

    // No temporal dimension and no explicit timespan.
    assert_error_kind(
        registry.query_datasets("bias", &["detector"], &in_collections(&["calibs"])),
        ErrorKind::Invalid,
    );
}

#[test]
fn test_materialized_query_matches_direct_execution() {
    let (ctx, loaded) = dataset_context();
    let registry = &ctx.registry;
    let search = DatasetSearch {
        dataset_type: registry.get_dataset_type("flat").unwrap(),
        collections: vec![
            registry.get_collection("imported_r").unwrap(),
            registry.get_collection("imported_g").unwrap(),
        ],
        find_first: false,
    };
    let graph = ctx.universe().extract(["visit", "detector"]).unwrap();
    let query = registry
        .query(graph)
        .where_expression("visit.seeing > 0")
        .unwrap()
        .join_dataset(search)
        .unwrap()
        .build()
        .unwrap();

    let direct = query.rows().unwrap();
    assert!(!direct.is_empty());
    assert_eq!(query.count().unwrap(), direct.len());

    let materialized = query.materialize().unwrap();
    let table = materialized.table().to_string();
    assert_eq!(sortable(materialized.rows().unwrap()), sortable(direct));
    assert_eq!(materialized.data_ids().unwrap(), query.data_ids().unwrap());
    // Visit 1 is Cam1-G and visit 2 is Cam1-R1, so only imported_g's flats join.
    assert_same_datasets(&materialized.dataset_refs(0).unwrap(), &loaded.flat_g);
    assert_same_datasets(&query.dataset_refs(0).unwrap(), &loaded.flat_g);
    assert_error_kind(materialized.dataset_refs(1), ErrorKind::Invalid);

    drop(materialized);
    assert_error_kind(registry.database().select(&table, &[]), ErrorKind::NotFound);
}

#[test]
fn test_chained_collections_are_searched_in_order() {
    let (ctx, loaded) = dataset_context();
    let registry = &ctx.registry;
    registry
        .register_collection("defaults", CollectionType::Chained, None)
        .unwrap();
    registry
        .set_collection_chain(
            "defaults",
            vec!["imported_g".into(), "imported_r".into()],
            false,
        )
        .unwrap();
    let first = registry
        .query_datasets(
            "bias",
            &["detector"],
            &QueryOptions {
                find_first: true,
                ..in_collections(&["defaults"])
            },
        )
        .unwrap();
    let mut expected = loaded.bias_g.clone();
    expected.push(loaded.bias_r[2].clone());
    assert_same_datasets(&first, &expected);

    let search = DatasetSearch {
        dataset_type: registry.get_dataset_type("bias").unwrap(),
        collections: vec![registry.get_collection("defaults").unwrap()],
        find_first: false,
    };
    let graph = ctx.universe().extract(["detector"]).unwrap();
    assert_error_kind(
        registry.query(graph).join_dataset(search).map(|_| ()),
        ErrorKind::Invalid,
    );
}
