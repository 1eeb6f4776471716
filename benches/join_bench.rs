//! JOIN benchmark: CopyPayload vs StorePointer, serial vs parallel, reuse vs
//! fresh hash tables.
//!
//! Simulates a range-filtered equi-join workload:
//!   SELECT b.payload, p.payload FROM probe p JOIN build b ON p.key = b.key
//!   WHERE p.key BETWEEN lo AND hi
//!
//! Measures:
//!   - Build throughput (tuples/sec into the bucket-chained hash table)
//!   - Probe throughput across predicate selectivity and key multiplicity
//!   - Cost of repeated overlapping-range joins with and without reuse
//!
//! Workload parameters:
//!   - Build keys: distinct keys on the build side, drawn from [0, build_keys)
//!   - Multiplicity: build-side duplicates per key (1 = unique, N = 1:N join)
//!   - Probe size: probe tuples, keys uniform over [0, 2 * build_keys)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use reusejoin::{
    CacheConfig, EngineConfig, Execution, JoinEngine, JoinSpec, KeyRange, ProbeMode, ReuseCache, Schema,
    Storage, Table, TableCursor,
};

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 20;

const TABLE_PAGE_SIZE: usize = 1 << 20;
const BUCKET_PAGE_SIZE: usize = 256;

struct JoinWorkload {
    build: Arc<Table>,
    probe: Arc<Table>,
    /// Keys of both sides lie in [0, domain).
    domain: i64,
}

impl JoinWorkload {
    /// Generate a join workload. Both sides are `[long key, long payload]`.
    fn generate(build_keys: usize, multiplicity: usize, probe_count: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let schema = Schema::from_spec(&["long", "long"]).unwrap().into_ref();

        // Build side: keys 0..build_keys, each repeated `multiplicity` times
        let mut build_rows = Vec::with_capacity(build_keys * multiplicity);
        for key in 0..build_keys as i64 {
            for dup in 0..multiplicity as i64 {
                build_rows.push((key, key * 1000 + dup));
            }
        }
        // Shuffle to simulate unordered input
        build_rows.shuffle(&mut rng);

        let domain = 2 * build_keys as i64;
        let mut tuple = vec![0u8; schema.tuple_size()];
        let mut build = Table::new(Arc::clone(&schema), TABLE_PAGE_SIZE);
        for (key, payload) in build_rows {
            schema.write_long(&mut tuple, 0, key);
            schema.write_long(&mut tuple, 1, payload);
            build.append(&tuple);
        }

        // Probe side: half the keys hit, half miss
        let mut probe = Table::new(Arc::clone(&schema), TABLE_PAGE_SIZE);
        for i in 0..probe_count as i64 {
            schema.write_long(&mut tuple, 0, rng.random_range(0..domain));
            schema.write_long(&mut tuple, 1, i);
            probe.append(&tuple);
        }

        Self {
            build: Arc::new(build),
            probe: Arc::new(probe),
            domain,
        }
    }

    fn engine(&self, config: EngineConfig, range: KeyRange) -> JoinEngine {
        JoinEngine::init(
            config,
            JoinSpec {
                build_schema: Arc::clone(self.build.schema()),
                build_select: vec![1],
                build_key: 0,
                probe_schema: Arc::clone(self.probe.schema()),
                probe_select: vec![1],
                probe_key: 0,
                selectivity: range.width() as f64 * 100.0 / self.domain as f64,
                range,
            },
        )
        .unwrap()
    }

    fn full_range(&self) -> KeyRange {
        KeyRange::new(0, self.domain)
    }
}

fn engine_config(storage: Storage, execution: Execution) -> EngineConfig {
    EngineConfig {
        storage,
        execution,
        output_page_size: TABLE_PAGE_SIZE,
        ..EngineConfig::default()
    }
}

fn variants() -> Vec<(&'static str, EngineConfig)> {
    vec![
        ("copy/serial", engine_config(Storage::CopyPayload, Execution::Serial)),
        ("pointer/serial", engine_config(Storage::StorePointer, Execution::Serial)),
        (
            "copy/4threads",
            engine_config(Storage::CopyPayload, Execution::Parallel { threads: 4 }),
        ),
        (
            "pointer/4threads",
            engine_config(Storage::StorePointer, Execution::Parallel { threads: 4 }),
        ),
    ]
}

/// Builds a fresh hash table over `range` and returns the records inserted.
fn build_once(engine: &JoinEngine, build: &Arc<Table>, range: KeyRange) -> u64 {
    let mut cache = ReuseCache::new(CacheConfig::default());
    let (entry, _) = cache.acquire(range, BUCKET_PAGE_SIZE, engine.record_size());
    engine
        .build(&TableCursor::new(Arc::clone(build)), entry)
        .unwrap()
        .inserted
}

fn bench_build_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &build_size in &[10_000, 100_000, 1_000_000] {
        let workload = JoinWorkload::generate(build_size, 1, 0, 42);
        let range = workload.full_range();
        group.throughput(Throughput::Elements(build_size as u64));

        for (label, config) in variants() {
            let engine = workload.engine(config, range);
            group.bench_with_input(BenchmarkId::new(label, build_size), &workload.build, |b, build| {
                b.iter(|| build_once(&engine, black_box(build), range))
            });
        }
    }

    group.finish();
}

fn bench_probe_selectivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_selectivity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build_size = 100_000;
    let probe_count = 1_000_000;
    let workload = JoinWorkload::generate(build_size, 1, probe_count, 42);

    // Varying predicate width: 1%, 10%, 50%, 100% of the key domain
    for &selectivity in &[0.01, 0.1, 0.5, 1.0] {
        let width = (workload.domain as f64 * selectivity) as i64;
        let range = KeyRange::new(0, width);
        let sel_label = format!("{:.0}pct", selectivity * 100.0);
        group.throughput(Throughput::Elements(probe_count as u64));

        for (label, config) in variants() {
            let engine = workload.engine(config, range);
            // Pre-build (not measured)
            let mut cache = ReuseCache::new(CacheConfig::default());
            let (entry, _) = cache.acquire(range, BUCKET_PAGE_SIZE, engine.record_size());
            engine
                .build(&TableCursor::new(Arc::clone(&workload.build)), entry)
                .unwrap();
            let entry = &*entry;

            group.bench_with_input(BenchmarkId::new(label, &sel_label), &workload.probe, |b, probe| {
                b.iter(|| {
                    let cursor = TableCursor::new(Arc::clone(black_box(probe)));
                    engine.probe(&cursor, entry).unwrap().matches
                })
            });
        }
    }

    group.finish();
}

fn bench_probe_multiplicity(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_multiplicity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build_keys = 50_000;
    let probe_count = 500_000;

    // Varying multiplicity: 1 (unique), 2, 5, 10
    for &multiplicity in &[1, 2, 5, 10] {
        let workload = JoinWorkload::generate(build_keys, multiplicity, probe_count, 42);
        let range = workload.full_range();
        group.throughput(Throughput::Elements(probe_count as u64));

        for mode in [ProbeMode::Assemble, ProbeMode::HashOnly] {
            let engine = workload.engine(
                EngineConfig {
                    probe_mode: mode,
                    ..engine_config(Storage::CopyPayload, Execution::Serial)
                },
                range,
            );
            let mut cache = ReuseCache::new(CacheConfig::default());
            let (entry, _) = cache.acquire(range, BUCKET_PAGE_SIZE, engine.record_size());
            engine
                .build(&TableCursor::new(Arc::clone(&workload.build)), entry)
                .unwrap();
            let entry = &*entry;

            group.bench_with_input(
                BenchmarkId::new(format!("{mode:?}"), multiplicity),
                &workload.probe,
                |b, probe| {
                    b.iter(|| {
                        let cursor = TableCursor::new(Arc::clone(black_box(probe)));
                        engine.probe(&cursor, entry).unwrap().matches
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_prefetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefetch");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 1_000_000;

    // Bucket chains out of cache: the build side exceeds the LLC
    for &build_size in &[10_000, 1_000_000] {
        let workload = JoinWorkload::generate(build_size, 1, probe_count, 42);
        let range = workload.full_range();
        group.throughput(Throughput::Elements(probe_count as u64));

        for prefetch in [false, true] {
            let engine = workload.engine(
                EngineConfig {
                    prefetch,
                    probe_mode: ProbeMode::HashOnly,
                    ..engine_config(Storage::CopyPayload, Execution::Serial)
                },
                range,
            );
            let mut cache = ReuseCache::new(CacheConfig::default());
            let (entry, _) = cache.acquire(range, BUCKET_PAGE_SIZE, engine.record_size());
            engine
                .build(&TableCursor::new(Arc::clone(&workload.build)), entry)
                .unwrap();
            let entry = &*entry;
            let label = if prefetch { "prefetch" } else { "plain" };

            group.bench_with_input(BenchmarkId::new(label, build_size), &workload.probe, |b, probe| {
                b.iter(|| {
                    let cursor = TableCursor::new(Arc::clone(black_box(probe)));
                    engine.probe(&cursor, entry).unwrap().matches
                })
            });
        }
    }

    group.finish();
}

fn bench_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("reuse");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    // Ten passes of a 10% range sliding by 1% of the domain each time:
    // consecutive ranges overlap by 90%.
    let workload = JoinWorkload::generate(200_000, 1, 200_000, 42);
    let step = workload.domain / 100;
    let ranges: Vec<KeyRange> = (0..10)
        .map(|i| KeyRange::new(i * step, i * step + 10 * step))
        .collect();
    group.throughput(Throughput::Elements(ranges.len() as u64));

    // A zero budget drops every table at collection, so each pass builds
    // from scratch. The disabled cache grows one table across all passes.
    let caches: [(&str, fn() -> ReuseCache); 3] = [
        ("fresh", || {
            ReuseCache::new(CacheConfig {
                max_size: 0,
                ..CacheConfig::default()
            })
        }),
        ("single", ReuseCache::disabled),
        ("reuse", || ReuseCache::new(CacheConfig::default())),
    ];
    for (label, make_cache) in caches {
        let mut engine = workload.engine(engine_config(Storage::CopyPayload, Execution::Serial), ranges[0]);
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut cache = make_cache();
                let mut matches = 0;
                for &range in &ranges {
                    engine.set_range(range);
                    let (entry, _) = cache.acquire(range, BUCKET_PAGE_SIZE, engine.record_size());
                    engine
                        .build(&TableCursor::new(Arc::clone(&workload.build)), entry)
                        .unwrap();
                    matches += engine
                        .probe(&TableCursor::new(Arc::clone(&workload.probe)), entry)
                        .unwrap()
                        .matches;
                    cache.garbage_collection();
                }
                matches
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_build_throughput,
    bench_probe_selectivity,
    bench_probe_multiplicity,
    bench_prefetch,
    bench_reuse,
);
criterion_main!(benches);
