//! Repeated range-join experiment.
//!
//! Loads both inputs once, then runs `iterations` join passes. Every pass
//! selects a random key range covering `selectivity` percent of the key
//! domain, takes a hash table from the reuse cache (reused or fresh), tops it
//! up from the build input, probes it and lets the cache collect.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::JoinConfig;
use crate::engine::{BuildStats, JoinEngine, JoinSpec};
use crate::error::{JoinError, Result};
use crate::range::KeyRange;
use crate::table::{Table, TableCursor, TupleSource};

#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass: usize,
    pub range: KeyRange,
    pub reused: bool,
    pub build: BuildStats,
    pub probed: u64,
    pub matches: u64,
    pub output_rows: usize,
    pub evicted: usize,
    pub build_time: Duration,
    pub probe_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub build_rows: usize,
    pub probe_rows: usize,
    pub passes: Vec<PassReport>,
    /// Where the last pass's output was written, if it was.
    pub dump: Option<PathBuf>,
}

/// Runs the experiment described by `config`.
pub fn run(config: &JoinConfig) -> Result<RunSummary> {
    let build_schema = config.build.parse_schema()?.into_ref();
    let probe_schema = config.probe.parse_schema()?.into_ref();
    for (side, schema) in [("build", &build_schema), ("probe", &probe_schema)] {
        if schema.tuple_size() > config.bucksize {
            return Err(JoinError::Config(format!(
                "{}-byte {side} tuples do not fit {}-byte pages",
                schema.tuple_size(),
                config.bucksize
            )));
        }
    }

    let mut build = Table::new(Arc::clone(&build_schema), config.bucksize);
    let mut probe = Table::new(Arc::clone(&probe_schema), config.bucksize);
    let build_rows = build.load(config.build_path(), config.separator)?;
    let probe_rows = probe.load(config.probe_path(), config.separator)?;
    let build = TableCursor::new(Arc::new(build));
    let probe = TableCursor::new(Arc::new(probe));

    let exp = &config.experiment;
    let width = range_width(exp.domain, exp.selectivity);
    let mut rng = ChaCha8Rng::seed_from_u64(exp.seed);
    let mut engine = JoinEngine::init(
        config.engine_config(),
        JoinSpec {
            build_schema,
            build_select: config.build.select_columns(),
            build_key: config.build.join_column(),
            probe_schema,
            probe_select: config.probe.select_columns(),
            probe_key: config.probe.join_column(),
            selectivity: exp.selectivity,
            range: KeyRange::new(0, width),
        },
    )?;
    let bucket_size = config.algorithm.buildpagesize;
    if engine.record_size() > bucket_size {
        return Err(JoinError::Config(format!(
            "{}-byte hash records do not fit {bucket_size}-byte bucket pages",
            engine.record_size()
        )));
    }

    info!(
        build_rows,
        probe_rows,
        iterations = exp.iterations,
        selectivity = engine.selectivity(),
        width,
        storage = ?engine.config().storage,
        execution = ?engine.config().execution,
        "starting join passes"
    );

    let mut cache = config.reuse_cache();
    let mut passes = Vec::with_capacity(exp.iterations);
    let mut last_output = None;

    for pass in 0..exp.iterations {
        let start = rng.random_range(0..=exp.domain - width);
        let range = KeyRange::new(start, start + width);
        engine.set_range(range);

        let (entry, reused) = cache.acquire(range, bucket_size, engine.record_size());

        let t = Instant::now();
        let build_stats = engine.build(&build.clone(), entry)?;
        let build_time = t.elapsed();

        let t = Instant::now();
        let result = engine.probe(&probe.clone(), entry)?;
        let probe_time = t.elapsed();

        let output_rows = result.output.table().len();
        info!(
            pass,
            %range,
            reused,
            inserted = build_stats.inserted,
            matches = result.matches,
            output_rows,
            build_ms = build_time.as_secs_f64() * 1e3,
            probe_ms = probe_time.as_secs_f64() * 1e3,
            "join pass finished"
        );
        last_output = Some(result.output);

        let evicted = cache.garbage_collection();
        passes.push(PassReport {
            pass,
            range,
            reused,
            build: build_stats,
            probed: result.probed,
            matches: result.matches,
            output_rows,
            evicted,
            build_time,
            probe_time,
        });
    }

    let mut dump = None;
    if cfg!(debug_assertions) || config.dump {
        if let Some(output) = &last_output {
            let path = config.output_path();
            let file = BufWriter::new(File::create(&path)?);
            output.table().write_pretty(file, '|')?;
            info!(path = %path.display(), rows = output.table().len(), "wrote output");
            dump = Some(path);
        }
    }

    Ok(RunSummary {
        build_rows,
        probe_rows,
        passes,
        dump,
    })
}

/// Keys per pass range: `selectivity` percent of `domain`, at least one.
fn range_width(domain: i64, selectivity: f64) -> i64 {
    let width = (domain as f64 * selectivity / 100.0).round() as i64;
    width.clamp(1, domain)
}
