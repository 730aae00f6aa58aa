//! Property-based tests for certification invariants.
//!
//! Random certify/decertify sequences are replayed against a model that
//! tracks which fixture hours each detector's bias is valid for.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use datum_core::ErrorKind;
use datum_registry::{CollectionQuery, CollectionType, DatasetAssociation};
use datum_test_utils::{
    assert_disjoint_certifications, detector_id, load_datasets, span, TestContext,
};
use proptest::prelude::*;

const HOURS: u32 = 12;

#[derive(Debug, Clone)]
enum Op {
    Certify { detector: usize, begin: u32, end: u32 },
    Decertify { begin: u32, end: u32 },
}

fn arb_range() -> impl Strategy<Value = (u32, u32)> {
    (0..HOURS, 1..=4_u32).prop_map(|(begin, len)| (begin, (begin + len).min(HOURS + 1)))
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..3_usize, arb_range())
            .prop_map(|(detector, (begin, end))| Op::Certify { detector, begin, end }),
        1 => arb_range().prop_map(|(begin, end)| Op::Decertify { begin, end }),
    ]
}

fn certifications(ctx: &TestContext) -> Vec<DatasetAssociation> {
    ctx.registry
        .query_dataset_associations(
            "bias",
            &CollectionQuery {
                patterns: vec!["calibs".into()],
                ..CollectionQuery::default()
            },
        )
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn certification_matches_hour_model(ops in prop::collection::vec(arb_op(), 1..12)) {
        let ctx = TestContext::with_base_data();
        let loaded = load_datasets(&ctx.registry).unwrap();
        ctx.registry
            .register_collection("calibs", CollectionType::Calibration, None)
            .unwrap();

        // covered[detector][hour]
        let mut covered = [[false; HOURS as usize + 1]; 3];
        for op in &ops {
            match *op {
                Op::Certify { detector, begin, end } => {
                    let hours = begin as usize..end as usize;
                    let clash = covered[detector][hours.clone()].iter().any(|c| *c);
                    let result = ctx.registry.certify(
                        "calibs",
                        &loaded.bias_g[detector..=detector],
                        span(Some(begin), Some(end)),
                    );
                    if clash {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
                    } else {
                        prop_assert!(result.is_ok());
                        covered[detector][hours].iter_mut().for_each(|c| *c = true);
                    }
                }
                Op::Decertify { begin, end } => {
                    ctx.registry
                        .decertify("calibs", "bias", span(Some(begin), Some(end)), None)
                        .unwrap();
                    for row in &mut covered {
                        row[begin as usize..end as usize].iter_mut().for_each(|c| *c = false);
                    }
                }
            }
            assert_disjoint_certifications(&certifications(&ctx));
        }

        for (detector, row) in covered.iter().enumerate() {
            let data_id = detector_id(i64::try_from(detector + 1).unwrap());
            for (hour, expected) in row.iter().enumerate() {
                let hour = u32::try_from(hour).unwrap();
                let found = ctx
                    .registry
                    .find_dataset(
                        "bias",
                        &data_id,
                        &["calibs".to_string()],
                        Some(span(Some(hour), Some(hour + 1))),
                    )
                    .unwrap();
                prop_assert_eq!(found.is_some(), *expected, "detector {} hour {}", detector + 1, hour);
            }
        }
    }

    #[test]
    fn decertify_leaves_nothing_in_the_removed_range(
        certified in arb_range(),
        removed in arb_range(),
    ) {
        let ctx = TestContext::with_base_data();
        let loaded = load_datasets(&ctx.registry).unwrap();
        ctx.registry
            .register_collection("calibs", CollectionType::Calibration, None)
            .unwrap();
        ctx.registry
            .certify("calibs", &loaded.bias_g, span(Some(certified.0), Some(certified.1)))
            .unwrap();

        let removed_span = span(Some(removed.0), Some(removed.1));
        ctx.registry.decertify("calibs", "bias", removed_span, None).unwrap();

        let remaining = certifications(&ctx);
        for association in &remaining {
            let timespan = association.timespan.unwrap();
            prop_assert!(!timespan.overlaps(&removed_span), "{} overlaps {}", timespan, removed_span);
        }
        assert_disjoint_certifications(&remaining);

        let kept_hours = (certified.0..certified.1)
            .filter(|h| !(removed.0..removed.1).contains(h))
            .count();
        let expected_pieces = usize::from(certified.0 < removed.0.min(certified.1))
            + usize::from(removed.1.max(certified.0) < certified.1);
        prop_assert_eq!(remaining.len(), expected_pieces * loaded.bias_g.len());
        prop_assert_eq!(kept_hours == 0, remaining.is_empty());
    }
}
