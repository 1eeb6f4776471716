//! Range-filtered hash join: build into a cached table, probe it, emit rows.
//!
//! One [`JoinEngine`] is set up per join configuration and then driven over
//! any number of passes, each restricted to a key range. Two choices shape a
//! pass:
//!
//! * [`Storage`] decides what a hash-table record holds. `CopyPayload`
//!   stores the key followed by the selected build columns, so probing never
//!   touches the build input again. `StorePointer` stores the key and a
//!   [`TupleRef`] into the build table, keeping records small at the price of
//!   a dereference per match.
//! * [`Execution`] picks the single-threaded path or a scoped worker pool.
//!   Both run the same core; the parallel one allocates through the hash
//!   table's per-bucket locks and claims input pages atomically.
//!
//! Build record layout: `[key, build_select...]` or `[key, pointer]`.
//! Output layout: `[build_select..., probe_select...]`.

use std::iter::Sum;
use std::ops::Add;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};

use tracing::debug;

use crate::cache::CacheEntry;
use crate::error::{JoinError, Result, Side};
use crate::hash::bucket_of;
use crate::hashtable::{HashTable, SlotAllocator};
use crate::range::{KeyRange, KeySet};
use crate::schema::{ColumnType, Schema, SchemaRef};
use crate::table::{Table, TableAppender, TableCursor, TupleRef, TupleSource};

pub const DEFAULT_OUTPUT_PAGE_SIZE: usize = 16 * 1024;

/// Probe tuples between issuing a bucket prefetch and walking that bucket.
const PREFETCH_DISTANCE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    CopyPayload,
    StorePointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    #[default]
    Serial,
    Parallel { threads: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// Build and append every joined row.
    #[default]
    Assemble,
    /// Hash and walk buckets only; matches are counted, nothing is emitted.
    HashOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub storage: Storage,
    pub execution: Execution,
    pub probe_mode: ProbeMode,
    /// Page size of the output table.
    pub output_page_size: usize,
    /// Prefetch buckets a few probe tuples ahead.
    pub prefetch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: Storage::default(),
            execution: Execution::default(),
            probe_mode: ProbeMode::default(),
            output_page_size: DEFAULT_OUTPUT_PAGE_SIZE,
            prefetch: false,
        }
    }
}

/// Inputs of a join: both schemas, their join columns and the columns each
/// side contributes to the output. Column indices are 0-based.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub build_schema: SchemaRef,
    pub build_select: Vec<usize>,
    pub build_key: usize,
    pub probe_schema: SchemaRef,
    pub probe_select: Vec<usize>,
    pub probe_key: usize,
    /// Share of the key domain a pass selects, in percent. Informational.
    pub selectivity: f64,
    pub range: KeyRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Records written into the hash table.
    pub inserted: u64,
    /// Tuples whose key fell outside the active range.
    pub out_of_range: u64,
    /// Tuples skipped because a reused table already holds their key.
    pub already_built: u64,
}

impl Add for BuildStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            inserted: self.inserted + rhs.inserted,
            out_of_range: self.out_of_range + rhs.out_of_range,
            already_built: self.already_built + rhs.already_built,
        }
    }
}

impl Sum for BuildStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ProbeCounts {
    probed: u64,
    matches: u64,
}

impl Add for ProbeCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            probed: self.probed + rhs.probed,
            matches: self.matches + rhs.matches,
        }
    }
}

pub struct ProbeResult {
    /// Joined rows; empty under [`ProbeMode::HashOnly`].
    pub output: TableCursor,
    /// Probe tuples inside the active range.
    pub probed: u64,
    /// Matching (build, probe) pairs.
    pub matches: u64,
}

/// Where probe workers put joined rows.
trait OutputSink {
    fn emit(&mut self, tuple: &[u8]);
}

impl OutputSink for Table {
    #[inline(always)]
    fn emit(&mut self, tuple: &[u8]) {
        self.append(tuple);
    }
}

impl OutputSink for &TableAppender<'_> {
    #[inline(always)]
    fn emit(&mut self, tuple: &[u8]) {
        self.append(tuple);
    }
}

pub struct JoinEngine {
    config: EngineConfig,
    build_schema: SchemaRef,
    build_select: Vec<usize>,
    build_key: usize,
    probe_schema: SchemaRef,
    probe_select: Vec<usize>,
    probe_key: usize,
    record: SchemaRef,
    output: SchemaRef,
    selectivity: f64,
    range: KeyRange,
}

impl JoinEngine {
    /// Validates the join columns and derives the record and output layouts.
    pub fn init(config: EngineConfig, spec: JoinSpec) -> Result<Self> {
        let JoinSpec {
            build_schema,
            build_select,
            build_key,
            probe_schema,
            probe_select,
            probe_key,
            selectivity,
            range,
        } = spec;

        check_column(&build_schema, build_key, Side::Build)?;
        check_column(&probe_schema, probe_key, Side::Probe)?;
        for &col in &build_select {
            check_column(&build_schema, col, Side::Build)?;
        }
        for &col in &probe_select {
            check_column(&probe_schema, col, Side::Probe)?;
        }

        let build_ty = build_schema.column_type(build_key);
        let probe_ty = probe_schema.column_type(probe_key);
        if !build_ty.is_join_key() {
            return Err(JoinError::JoinColumnType {
                side: Side::Build,
                column: build_key,
                found: build_ty,
            });
        }
        if !probe_ty.is_join_key() {
            return Err(JoinError::JoinColumnType {
                side: Side::Probe,
                column: probe_key,
                found: probe_ty,
            });
        }
        if build_ty != probe_ty {
            return Err(JoinError::Schema(format!(
                "join columns differ: build is {build_ty:?}, probe is {probe_ty:?}"
            )));
        }
        if build_select.is_empty() && probe_select.is_empty() {
            return Err(JoinError::Schema("join selects no output columns".into()));
        }
        if let Execution::Parallel { threads: 0 } = config.execution {
            return Err(JoinError::Config("parallel execution needs at least one thread".into()));
        }

        let mut record = Schema::new();
        record.push(build_schema.get(build_key));
        match config.storage {
            Storage::CopyPayload => {
                for &col in &build_select {
                    record.push(build_schema.get(col));
                }
            }
            Storage::StorePointer => record.add(ColumnType::Pointer, 0),
        }

        let mut output = build_schema.project(&build_select);
        for &col in &probe_select {
            output.push(probe_schema.get(col));
        }
        if output.tuple_size() > config.output_page_size {
            return Err(JoinError::Config(format!(
                "{}-byte output rows do not fit {}-byte output pages",
                output.tuple_size(),
                config.output_page_size
            )));
        }

        debug!(
            storage = ?config.storage,
            execution = ?config.execution,
            record_size = record.tuple_size(),
            output_size = output.tuple_size(),
            "join engine initialised"
        );

        Ok(Self {
            config,
            build_schema,
            build_select,
            build_key,
            probe_schema,
            probe_select,
            probe_key,
            record: record.into_ref(),
            output: output.into_ref(),
            selectivity,
            range,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Re-targets the engine for the next pass.
    pub fn set_range(&mut self, range: KeyRange) {
        self.range = range;
    }

    pub fn selectivity(&self) -> f64 {
        self.selectivity
    }

    /// Bytes per hash-table record; the tuple size cache entries need.
    pub fn record_size(&self) -> usize {
        self.record.tuple_size()
    }

    pub fn record_schema(&self) -> &SchemaRef {
        &self.record
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output
    }

    fn check_entry(&self, entry: &CacheEntry) -> Result<()> {
        let held = entry.hash_table().tuple_size();
        if held != self.record_size() {
            return Err(JoinError::Config(format!(
                "cache entry holds {held}-byte records, engine writes {}-byte records",
                self.record_size()
            )));
        }
        Ok(())
    }

    /// Inserts the in-range build tuples of `source` into `entry`.
    ///
    /// Reads the pages `source` has not handed out yet. On a reused entry
    /// keys it already holds are skipped. Afterwards the entry covers the
    /// active range.
    pub fn build<S: TupleSource>(&self, source: &S, entry: &mut CacheEntry) -> Result<BuildStats> {
        if **source.schema() != *self.build_schema {
            return Err(JoinError::Schema("build input does not match the build schema".into()));
        }
        self.check_entry(entry)?;
        if self.config.storage == Storage::StorePointer {
            entry.bind_source(source.table())?;
        }

        let built = entry.built().clone();
        let built = &built;
        let stats = match self.config.execution {
            Execution::Serial => self.build_core::<false, _, _>(source, entry.hash_table_mut(), built),
            Execution::Parallel { threads } => {
                let alloc = entry.hash_table_mut().atomic_allocator();
                thread::scope(|s| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let mut alloc = &alloc;
                            s.spawn(move || self.build_core::<true, _, _>(source, &mut alloc, built))
                        })
                        .collect();
                    handles.into_iter().map(join_worker).sum::<BuildStats>()
                })
            }
        };
        entry.mark_built(self.range);

        debug!(
            range = %self.range,
            inserted = stats.inserted,
            out_of_range = stats.out_of_range,
            already_built = stats.already_built,
            records = entry.hash_table().len(),
            "build finished"
        );
        Ok(stats)
    }

    #[inline(always)]
    fn build_core<const ATOMIC: bool, S: TupleSource, A: SlotAllocator>(
        &self,
        source: &S,
        alloc: &mut A,
        built: &KeySet,
    ) -> BuildStats {
        let schema = source.schema();
        let nbuckets = alloc.nbuckets();
        let mut stats = BuildStats::default();

        while let Some(page) = if ATOMIC {
            source.atomic_read_next()
        } else {
            source.read_next()
        } {
            for (at, tuple) in page.tuples() {
                let key = schema.as_key(tuple, self.build_key);
                if !self.range.contains(key) {
                    stats.out_of_range += 1;
                    continue;
                }
                if built.contains(key) {
                    stats.already_built += 1;
                    continue;
                }
                let key_bytes = schema.field(tuple, self.build_key);
                let record = alloc.slot(bucket_of(key_bytes, nbuckets));
                self.write_record(record, schema, tuple, at);
                stats.inserted += 1;
            }
        }
        stats
    }

    #[inline(always)]
    fn write_record(&self, record: &mut [u8], schema: &Schema, tuple: &[u8], at: TupleRef) {
        self.record.write_data(record, 0, schema.field(tuple, self.build_key));
        match self.config.storage {
            Storage::CopyPayload => {
                for (j, &col) in self.build_select.iter().enumerate() {
                    self.record.write_data(record, j + 1, schema.field(tuple, col));
                }
            }
            Storage::StorePointer => self.record.write_pointer(record, 1, at),
        }
    }

    /// Joins the in-range probe tuples of `source` against `entry`.
    pub fn probe<S: TupleSource>(&self, source: &S, entry: &CacheEntry) -> Result<ProbeResult> {
        if **source.schema() != *self.probe_schema {
            return Err(JoinError::Schema("probe input does not match the probe schema".into()));
        }
        self.check_entry(entry)?;
        let build = match self.config.storage {
            Storage::StorePointer if !entry.hash_table().is_empty() => {
                Some(entry.source().ok_or(JoinError::BuildSideMismatch)?.as_ref())
            }
            _ => None,
        };

        let table = entry.hash_table();
        let mut output = Table::new(Arc::clone(&self.output), self.config.output_page_size);
        let counts = match self.config.execution {
            Execution::Serial => self.probe_core::<false, _, _>(source, table, build, &mut output),
            Execution::Parallel { threads } => {
                let appender = output.atomic_appender();
                thread::scope(|s| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let mut sink = &appender;
                            s.spawn(move || self.probe_core::<true, _, _>(source, table, build, &mut sink))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(join_worker)
                        .fold(ProbeCounts::default(), Add::add)
                })
            }
        };

        debug!(
            range = %self.range,
            probed = counts.probed,
            matches = counts.matches,
            output = output.len(),
            "probe finished"
        );
        Ok(ProbeResult {
            output: output.into_cursor(),
            probed: counts.probed,
            matches: counts.matches,
        })
    }

    #[inline(always)]
    fn probe_core<const ATOMIC: bool, S: TupleSource, O: OutputSink>(
        &self,
        source: &S,
        table: &HashTable,
        build: Option<&Table>,
        out: &mut O,
    ) -> ProbeCounts {
        let schema = source.schema();
        let nbuckets = table.nbuckets();
        let assemble = self.config.probe_mode == ProbeMode::Assemble;
        let key_pos = self.probe_key;
        let mut joined = vec![0u8; self.output.tuple_size()];
        let mut counts = ProbeCounts::default();
        let mut it = table.iterator();

        while let Some(page) = if ATOMIC {
            source.atomic_read_next()
        } else {
            source.read_next()
        } {
            let mut ahead = page.page.tuples().skip(PREFETCH_DISTANCE);
            for tuple in page.page.tuples() {
                if self.config.prefetch {
                    if let Some(next) = ahead.next() {
                        table.prefetch(bucket_of(schema.field(next, key_pos), nbuckets));
                    }
                }

                let key = schema.as_key(tuple, key_pos);
                if !self.range.contains(key) {
                    continue;
                }
                counts.probed += 1;

                let key_bytes = schema.field(tuple, key_pos);
                table.place(&mut it, bucket_of(key_bytes, nbuckets));
                for record in it.by_ref() {
                    if self.record.field(record, 0) != key_bytes {
                        continue;
                    }
                    counts.matches += 1;
                    if assemble && self.assemble(&mut joined, record, schema, tuple, build) {
                        out.emit(&joined);
                    }
                }
            }
        }
        counts
    }

    /// Writes the output row for one match into `joined`.
    #[inline(always)]
    fn assemble(
        &self,
        joined: &mut [u8],
        record: &[u8],
        probe_schema: &Schema,
        probe_tuple: &[u8],
        build: Option<&Table>,
    ) -> bool {
        match self.config.storage {
            Storage::CopyPayload => {
                // The record payload has the same layout as the output prefix.
                let payload = &record[self.record.width(0)..];
                joined[..payload.len()].copy_from_slice(payload);
            }
            Storage::StorePointer => {
                let at = self.record.as_pointer(record, 1);
                let Some(src) = build.and_then(|t| t.tuple(at)) else {
                    debug_assert!(false, "dangling build reference {at}");
                    return false;
                };
                for (j, &col) in self.build_select.iter().enumerate() {
                    self.output.write_data(joined, j, self.build_schema.field(src, col));
                }
            }
        }
        let base = self.build_select.len();
        for (j, &col) in self.probe_select.iter().enumerate() {
            self.output
                .write_data(joined, base + j, probe_schema.field(probe_tuple, col));
        }
        true
    }
}

fn check_column(schema: &Schema, col: usize, side: Side) -> Result<()> {
    if col >= schema.columns() {
        return Err(JoinError::Schema(format!(
            "{side} column {} does not exist, schema has {} columns",
            col + 1,
            schema.columns()
        )));
    }
    Ok(())
}

fn join_worker<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(v) => v,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
