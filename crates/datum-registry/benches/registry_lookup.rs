//! Benchmarks for dataset lookups and dimension queries.
//!
//! Chain lookups scale with the number of runs searched before a match;
//! every run but the last is empty for the requested data ID.

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use datum_registry::{ChainLink, CollectionType, QueryOptions, Registry};
use datum_test_utils::{
    detector_id, load_datasets, load_observations, span, TestContext, INSTRUMENT,
};

fn populated(runs: usize) -> TestContext {
    let ctx = TestContext::with_base_data();
    load_observations(&ctx.registry).expect("load observations");
    load_datasets(&ctx.registry).expect("load datasets");
    let registry: &Registry = &ctx.registry;

    let mut links = Vec::with_capacity(runs + 1);
    for i in 0..runs {
        let name = format!("empty/{i:03}");
        registry.register_run(&name, None, None).expect("register run");
        links.push(ChainLink::new(name));
    }
    links.push(ChainLink::new("imported_g"));
    registry
        .register_collection("chain", CollectionType::Chained, None)
        .expect("register chain");
    registry
        .set_collection_chain("chain", links, false)
        .expect("set chain");

    registry
        .register_collection("calibs", CollectionType::Calibration, None)
        .expect("register calibs");
    let biases = registry
        .query_datasets(
            "bias",
            &["detector"],
            &QueryOptions {
                collections: vec!["imported_g".to_string()],
                ..QueryOptions::default()
            },
        )
        .expect("query biases");
    registry
        .certify("calibs", &biases, span(None, Some(4)))
        .expect("certify");
    ctx
}

fn find_dataset_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_dataset");
    let data_id = detector_id(2);

    for runs in [0, 10, 50] {
        let ctx = populated(runs);
        let collections = vec!["chain".to_string()];
        group.bench_with_input(BenchmarkId::new("run_chain", runs), &runs, |b, _| {
            b.iter(|| {
                let found = ctx
                    .registry
                    .find_dataset("bias", black_box(&data_id), &collections, None);
                black_box(found.is_ok());
            });
        });
    }

    let ctx = populated(0);
    let calibs = vec!["calibs".to_string()];
    let during = Some(span(Some(1), Some(2)));
    group.bench_function("calibration", |b| {
        b.iter(|| {
            let found = ctx
                .registry
                .find_dataset("bias", black_box(&data_id), &calibs, during);
            black_box(found.is_ok());
        });
    });

    group.finish();
}

fn query_data_ids_benchmark(c: &mut Criterion) {
    let ctx = populated(0);
    let mut group = c.benchmark_group("query_data_ids");

    for dimensions in [
        vec!["detector"],
        vec!["exposure", "detector"],
        vec!["visit", "detector", "patch"],
    ] {
        group.bench_function(dimensions.join("_"), |b| {
            b.iter(|| {
                let rows = ctx
                    .registry
                    .query_data_ids(black_box(dimensions.as_slice()), &QueryOptions::default());
                black_box(rows.map(|r| r.len()).unwrap_or_default());
            });
        });
    }

    let filtered = QueryOptions {
        where_clause: Some(format!(
            "instrument = '{INSTRUMENT}' AND detector.purpose = 'SCIENCE' AND visit.seeing < 1.0"
        )),
        ..QueryOptions::default()
    };
    group.bench_function("visit_detector_where", |b| {
        b.iter(|| {
            let rows = ctx
                .registry
                .query_data_ids(&["visit", "detector"], black_box(&filtered));
            black_box(rows.map(|r| r.len()).unwrap_or_default());
        });
    });

    group.finish();
}

criterion_group!(benches, find_dataset_benchmark, query_data_ids_benchmark);
criterion_main!(benches);
