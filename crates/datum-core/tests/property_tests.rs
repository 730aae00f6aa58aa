//! Property-based tests for datum-core invariants.
//!
//! These tests use proptest to check graph interning, coordinate
//! standardization, and packer invariants across random inputs drawn from
//! the standard dimension universe.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use proptest::prelude::*;

use datum_core::prelude::*;
use datum_core::RecordMap;

fn universe() -> &'static DimensionUniverse {
    DimensionUniverse::standard().expect("standard universe")
}

/// Generates a random subset of the standard universe's dimension names.
fn arb_dimension_names() -> impl Strategy<Value = Vec<String>> {
    let names: Vec<String> = universe()
        .dimensions()
        .map(|d| d.name().to_string())
        .collect();
    prop::sample::subsequence(names.clone(), 0..=names.len())
}

/// Generates a value for a dimension based on its primary key type.
fn value_for(dimension: &DimensionElement, seed: u16) -> DataIdValue {
    match dimension.primary_key().map(|k| k.field_type) {
        Some(FieldType::String) => DataIdValue::from(format!("{}{seed}", dimension.name())),
        _ => DataIdValue::from(seed),
    }
}

fn visit_detector_data_id(visit: i64, detector: i64) -> DataCoordinate {
    let u = universe();
    let graph = u.extract(["instrument", "visit", "detector"]).unwrap();
    let mut values = BTreeMap::new();
    for (name, value) in [
        ("instrument", DataIdValue::from("Cam1")),
        ("visit", DataIdValue::Int(visit)),
        ("detector", DataIdValue::Int(detector)),
        ("physical_filter", DataIdValue::from("Cam1-G")),
        ("band", DataIdValue::from("g")),
        ("visit_system", DataIdValue::Int(0)),
    ] {
        values.insert(name.to_string(), value);
    }
    let full = DataCoordinate::from_mapping(&values, &graph).unwrap();
    assert!(full.has_full());

    let instrument = DimensionRecord::new(
        u.element("instrument").unwrap(),
        [
            ("name".to_string(), Value::from("Cam1")),
            ("visit_max".to_string(), Value::Int(1000)),
            ("detector_max".to_string(), Value::Int(200)),
        ],
    )
    .unwrap();
    let mut records = RecordMap::new();
    for element in graph.elements() {
        records.insert(element.name().to_string(), None);
    }
    records.insert("instrument".to_string(), Some(instrument));
    full.expanded(records).unwrap()
}

proptest! {
    #[test]
    fn extract_is_interned(names in arb_dimension_names()) {
        let a = universe().extract(&names).unwrap();
        let b = universe().extract(names.iter().rev()).unwrap();
        prop_assert!(a == b);
        prop_assert!(a.is_superset(&b) && b.is_superset(&a));
        prop_assert_eq!(DimensionGraph::decode(universe(), &a.encode()).unwrap(), a);
    }

    #[test]
    fn graph_partitions_into_required_and_implied(names in arb_dimension_names()) {
        let graph = universe().extract(&names).unwrap();
        prop_assert_eq!(
            graph.required().len() + graph.implied().len(),
            graph.dimensions().len()
        );
        for dim in graph.dimensions() {
            for dep in dim.required() {
                prop_assert!(graph.contains(dep));
            }
        }
    }

    #[test]
    fn standardize_round_trips(names in arb_dimension_names(), seed in 0u16..500) {
        let graph = universe().extract(&names).unwrap();
        let values: BTreeMap<String, DataIdValue> = graph
            .required()
            .iter()
            .map(|d| (d.name().to_string(), value_for(d, seed)))
            .collect();
        let data_id = DataCoordinate::from_mapping(&values, &graph).unwrap();
        prop_assert_eq!(data_id.by_name(), values.clone());

        let again = DataCoordinate::standardize(
            DataIdInput::Coordinate(&data_id),
            None,
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        prop_assert_eq!(&again, &data_id);
        prop_assert_eq!(data_id.subset(&graph).unwrap().has_full(), data_id.has_full());
    }

    #[test]
    fn packing_round_trips(visit in 0i64..1000, detector in 0i64..200) {
        let data_id = visit_detector_data_id(visit, detector);
        let (packed, bits) = data_id.pack("visit_detector").unwrap();
        prop_assert!(bits <= 18);
        let packer = universe().make_packer("visit_detector", &data_id).unwrap();
        let unpacked = packer.unpack(packed).unwrap();
        prop_assert_eq!(unpacked, data_id.subset(packer.dimensions()).unwrap());
    }
}

#[test]
fn packed_values_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for visit in 0..20 {
        for detector in 0..10 {
            let (packed, _) = visit_detector_data_id(visit, detector)
                .pack("visit_detector")
                .unwrap();
            assert!(seen.insert(packed), "duplicate packed value {packed}");
        }
    }
}

#[test]
fn out_of_range_values_do_not_pack() {
    let data_id = visit_detector_data_id(1000, 0);
    assert!(data_id.pack("visit_detector").is_err());
}
