//! Criterion benchmarks for the spill and merge pipeline.
//!
//! - Posting list normalization and merging
//! - K-way merge of sorted runs
//! - Multi-pass planner merges
//! - End-to-end postings builds with spilling

use std::hint::black_box;
use std::path::{Path, PathBuf};

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use postings_spill::build::{BuildOptions, build_id_postings};
use postings_spill::context::SpillContext;
use postings_spill::cooperative::NoYield;
use postings_spill::merge::{
    PlannerOptions, RowComparator, merge_runs_with_planner, merge_sorted_runs,
};
use postings_spill::postings::{
    PostingRow, Postings, PostingsMap, merge_id_lists, normalize_id_list,
};
use postings_spill::run::write_run_file;
use postings_spill::storage::WriteOptions;
use rand::Rng;
use rand::seq::SliceRandom;
use tempfile::TempDir;

/// Write `count` sorted runs of `rows_per_run` rows each.
fn generate_runs(
    ctx: &SpillContext,
    dir: &Path,
    count: usize,
    rows_per_run: usize,
) -> Vec<PathBuf> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| {
            let mut keys: Vec<String> = (0..rows_per_run)
                .map(|_| format!("tok{:06}", rng.random_range(0..100_000)))
                .collect();
            keys.sort();
            let rows = keys
                .into_iter()
                .map(|k| PostingRow::new(k, Postings::Ids(vec![i as u64])));
            let path = dir.join(format!("bench-{i:04}.jsonl"));
            write_run_file(ctx, &path, rows, &WriteOptions::default()).unwrap();
            path
        })
        .collect()
}

fn generate_postings_map(keys: usize, docs: u64) -> PostingsMap {
    let mut rng = rand::rng();
    let mut map = PostingsMap::new();
    for _ in 0..keys * 4 {
        let key = format!("{:03x}", rng.random_range(0..keys));
        let doc = rng.random_range(0..docs);
        match map.entry(key).or_insert_with(|| Postings::Ids(Vec::new())) {
            Postings::Ids(ids) => ids.push(doc),
            Postings::Tf(_) => {}
        }
    }
    map
}

/// Benchmark posting list helpers.
fn bench_postings(c: &mut Criterion) {
    let mut group = c.benchmark_group("postings");

    let mut rng = rand::rng();
    let mut shuffled: Vec<u64> = (0..10_000).collect();
    shuffled.shuffle(&mut rng);
    let sorted: Vec<u64> = (0..10_000).collect();
    let interleaved: Vec<u64> = (0..10_000).map(|i| i * 2 + 1).collect();

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("normalize_shuffled", |b| {
        b.iter(|| black_box(normalize_id_list(black_box(&shuffled))))
    });
    group.bench_function("normalize_sorted", |b| {
        b.iter(|| black_box(normalize_id_list(black_box(&sorted))))
    });
    group.bench_function("merge_interleaved", |b| {
        b.iter(|| black_box(merge_id_lists(sorted.clone(), black_box(&interleaved))))
    });

    group.finish();
}

/// Benchmark merging sorted runs.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = generate_runs(&ctx, dir.path(), 32, 500);
    let comparator = RowComparator::by_key();

    group.throughput(Throughput::Elements(32 * 500));
    group.bench_function("k_way_merge_32_runs", |b| {
        b.iter(|| {
            let merged = merge_sorted_runs::<PostingRow, _>(&runs, &comparator).unwrap();
            black_box(merged.count())
        })
    });

    group.bench_function("planner_merge_fan_in_4", |b| {
        let output = dir.path().join("planned.jsonl");
        let options = PlannerOptions {
            max_open_runs: 4,
            temp_dir: Some(dir.path().join("scratch")),
            ..PlannerOptions::new(&output)
        };
        b.iter(|| {
            let mut outcome = merge_runs_with_planner(&ctx, &runs, &comparator, &options).unwrap();
            outcome.cleanup.cleanup().unwrap();
            black_box(outcome.stats.rows)
        })
    });

    group.finish();
}

/// Benchmark end-to-end builds.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);

    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();

    group.bench_function("in_memory", |b| {
        b.iter_batched(
            || generate_postings_map(4096, 10_000),
            |mut map| {
                let built =
                    build_id_postings(&ctx, &mut map, &BuildOptions::new("bench"), &mut NoYield)
                        .unwrap();
                black_box(built.table.len())
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("spilled", |b| {
        let options = BuildOptions {
            spill_dir: Some(dir.path().to_path_buf()),
            spill_max_unique: Some(1),
            spill_buffer_rows: 256,
            max_open_runs: 8,
            ..BuildOptions::new("bench")
        };
        b.iter_batched(
            || generate_postings_map(4096, 10_000),
            |mut map| {
                let built = build_id_postings(&ctx, &mut map, &options, &mut NoYield).unwrap();
                black_box(built.table.len())
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_postings, bench_merge, bench_build);
criterion_main!(benches);
