//! Benchmarks for merging and sorting record streams.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use provflow::config::SortConfig;
use provflow::merge::ReconciledStreamMerger;
use provflow::records::RecordSource;
use provflow::sort::ExternalSorter;
use provflow::testing::{drain, VecSource};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn merge_benchmark(c: &mut Criterion) {
    c.bench_function("concat_merge_4x10k", |b| {
        b.iter(|| {
            let sources: Vec<Box<dyn RecordSource>> = (0..4)
                .map(|_| Box::new(VecSource::sequential(10_000)) as Box<dyn RecordSource>)
                .collect();
            black_box(drain(ReconciledStreamMerger::from_sources(sources)).map(|r| r.len()))
        })
    });
}

fn sort_benchmark(c: &mut Criterion) {
    let mut records = VecSource::sequential(20_000).records().to_vec();
    records.shuffle(&mut StdRng::seed_from_u64(7));

    c.bench_function("external_sort_in_memory_20k", |b| {
        b.iter(|| {
            let mut source = VecSource::new(records.clone());
            let sorted = ExternalSorter::new(SortConfig::default()).sort(&mut source, None);
            black_box(sorted.and_then(drain).map(|r| r.len()))
        })
    });

    let spilling = SortConfig::default().with_chunk_size(2_000).with_max_chunk_size(2_000);
    c.bench_function("external_sort_spilling_20k", |b| {
        b.iter(|| {
            let mut source = VecSource::new(records.clone());
            let sorted = ExternalSorter::new(spilling.clone()).sort(&mut source, None);
            black_box(sorted.and_then(drain).map(|r| r.len()))
        })
    });
}

criterion_group!(benches, merge_benchmark, sort_benchmark);
criterion_main!(benches);
