//! Custom assertion helpers for integration tests.

use std::collections::BTreeSet;
use std::fmt::Debug;

use datum_core::{DataCoordinate, DatasetId, ErrorKind, Result};
use datum_registry::{DatasetAssociation, DatasetRef};

/// Asserts that two dataset lists hold the same datasets, in any order.
///
/// # Panics
///
/// Panics if the dataset IDs differ.
pub fn assert_same_datasets(actual: &[DatasetRef], expected: &[DatasetRef]) {
    let ids = |refs: &[DatasetRef]| refs.iter().map(|r| r.id).collect::<BTreeSet<DatasetId>>();
    assert_eq!(
        ids(actual),
        ids(expected),
        "Expected datasets {:#?}, got {:#?}",
        expected.iter().map(ToString::to_string).collect::<Vec<_>>(),
        actual.iter().map(ToString::to_string).collect::<Vec<_>>(),
    );
    assert_eq!(actual.len(), expected.len(), "Duplicate datasets in result");
}

/// Asserts that two data ID lists hold the same data IDs, in any order.
///
/// # Panics
///
/// Panics if the sets differ or `actual` has duplicates.
pub fn assert_same_data_ids(actual: &[DataCoordinate], expected: &[DataCoordinate]) {
    let actual_set: BTreeSet<&DataCoordinate> = actual.iter().collect();
    let expected_set: BTreeSet<&DataCoordinate> = expected.iter().collect();
    assert_eq!(actual_set, expected_set, "Data ID sets differ");
    assert_eq!(actual_set.len(), actual.len(), "Duplicate data IDs in result");
}

/// Asserts that an operation failed with an error of `kind`.
///
/// # Panics
///
/// Panics if the result is `Ok` or the error has another kind.
pub fn assert_error_kind<T: Debug>(result: Result<T>, kind: ErrorKind) {
    match result {
        Ok(value) => panic!("Expected {kind:?} error, got Ok({value:?})"),
        Err(err) => assert_eq!(
            err.kind(),
            kind,
            "Expected {kind:?} error, got {:?}: {err}",
            err.kind()
        ),
    }
}

/// Asserts that no two certifications of one data ID in one collection
/// overlap in time.
///
/// # Panics
///
/// Panics if an association has no validity range or two ranges overlap.
pub fn assert_disjoint_certifications(associations: &[DatasetAssociation]) {
    for (i, a) in associations.iter().enumerate() {
        let span_a = a
            .timespan
            .unwrap_or_else(|| panic!("{} in {} has no validity range", a.dataset, a.collection));
        for b in &associations[i + 1..] {
            if a.collection != b.collection
                || a.dataset.dataset_type.name() != b.dataset.dataset_type.name()
                || a.dataset.data_id != b.dataset.data_id
            {
                continue;
            }
            let span_b = b.timespan.expect("validity range");
            assert!(
                !span_a.overlaps(&span_b),
                "{} {span_a} overlaps {} {span_b} in {}",
                a.dataset,
                b.dataset,
                a.collection
            );
        }
    }
}
