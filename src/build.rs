//! Building final postings tables from producer maps.
//!
//! A postings map is turned into a sorted `(vocab, postings)` table. Small maps
//! are sorted in memory. Large ones are spilled to sorted runs, merged (directly
//! or through the multi-pass planner) and folded so that rows sharing a key end
//! up as one normalized id list.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::collector::{
    CollectOptions, Collected, DEFAULT_SPILL_BUFFER_BYTES, DEFAULT_SPILL_BUFFER_ROWS, DfGuard,
    RunSet, collect_rows,
};
use crate::context::SpillContext;
use crate::cooperative::YieldProvider;
use crate::error::{Result, SpillError};
use crate::merge::engine::{RowComparator, merge_sorted_runs};
use crate::merge::planner::{
    DEFAULT_MAX_OPEN_RUNS, HintOptions, PlannerOptions, merge_runs_with_planner,
};
use crate::postings::{
    DocId, PostingRow, Postings, PostingsMap, TfPosting, merge_id_lists, normalize_id_list,
};
use crate::run::read_run;
use crate::storage::writer::WriteOptions;

/// Entries scanned before [`estimate_map_bytes`] extrapolates.
pub const ESTIMATE_SAMPLE_ROWS: usize = 4096;

/// Options for [`build_id_postings`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Run prefix and merge label, e.g. `phrase_postings`.
    pub label: String,
    /// Where spill runs and planner scratch files go. `None` keeps the build in
    /// memory.
    pub spill_dir: Option<PathBuf>,
    pub spill_max_unique: Option<usize>,
    pub spill_max_bytes: Option<usize>,
    /// Drop lists with more documents than this. `None` or zero disables.
    pub max_df: Option<usize>,
    pub max_open_runs: usize,
    pub spill_buffer_rows: usize,
    pub spill_buffer_bytes: usize,
    pub validate_comparator: bool,
    pub write: WriteOptions,
    pub hints: Option<HintOptions>,
}

impl BuildOptions {
    pub fn new<S: Into<String>>(label: S) -> Self {
        BuildOptions {
            label: label.into(),
            spill_dir: None,
            spill_max_unique: None,
            spill_max_bytes: None,
            max_df: None,
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
            spill_buffer_rows: DEFAULT_SPILL_BUFFER_ROWS,
            spill_buffer_bytes: DEFAULT_SPILL_BUFFER_BYTES,
            validate_comparator: false,
            write: WriteOptions::default(),
            hints: None,
        }
    }
}

/// Sorted vocabulary with one normalized id list per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingsTable {
    pub vocab: Vec<String>,
    pub postings: Vec<Vec<DocId>>,
}

impl PostingsTable {
    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&[DocId]> {
        let index = self.vocab.binary_search_by(|k| k.as_str().cmp(key)).ok()?;
        Some(&self.postings[index])
    }
}

/// How spilled runs were merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingsMergeStats {
    pub runs: usize,
    /// Merged rows read by the fold.
    pub rows: u64,
    pub bytes: u64,
    #[serde(rename = "planner")]
    pub planner_used: bool,
    pub planner_hint_used: bool,
    pub passes: u32,
    pub runs_merged: u64,
    pub elapsed_ms: u64,
}

/// Spill and document-frequency counters for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpillStats {
    pub spill_enabled: bool,
    pub spill_runs: usize,
    pub spill_rows: u64,
    pub spill_bytes: u64,
    pub spill_max_row_bytes: u64,
    /// Distinct keys in the source map before collection.
    pub peak_unique: usize,
    pub dropped_high_df: u64,
    /// Longest list seen, dropped lists included.
    pub max_df: usize,
}

/// Result of [`build_id_postings`].
#[derive(Debug, Clone, Default)]
pub struct BuiltPostings {
    pub table: PostingsTable,
    /// Present only when the build spilled.
    pub merge_stats: Option<PostingsMergeStats>,
    pub spill_stats: SpillStats,
}

struct ByteCounter(u64);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct RowRef<'a> {
    key: &'a str,
    postings: &'a Postings,
}

/// Estimated JSONL size of `map` as spill rows, newline included.
///
/// Scanning stops as soon as `limit` is reached. Past
/// [`ESTIMATE_SAMPLE_ROWS`] entries the average row size of the sample is
/// extrapolated to the whole map.
pub fn estimate_map_bytes(map: &PostingsMap, limit: Option<u64>) -> Result<u64> {
    let mut counter = ByteCounter(0);
    let mut sampled = 0usize;
    for (key, postings) in map.iter().take(ESTIMATE_SAMPLE_ROWS) {
        serde_json::to_writer(&mut counter, &RowRef { key, postings })?;
        counter.0 += 1;
        sampled += 1;
        if limit.is_some_and(|l| counter.0 >= l) {
            return Ok(counter.0);
        }
    }
    if sampled == 0 || sampled == map.len() {
        return Ok(counter.0);
    }
    Ok(counter.0 / sampled as u64 * map.len() as u64)
}

fn should_spill_by_bytes(map: &PostingsMap, max_bytes: Option<usize>) -> Result<bool> {
    match max_bytes.filter(|m| *m > 0) {
        Some(max_bytes) => {
            let limit = max_bytes as u64;
            Ok(estimate_map_bytes(map, Some(limit))? >= limit)
        }
        None => Ok(false),
    }
}

/// Folds a key-sorted row stream into a table, merging equal keys.
struct Fold<'a> {
    table: PostingsTable,
    guard: DfGuard,
    current: Option<(String, Vec<DocId>)>,
    rows: u64,
    yielder: &'a mut dyn YieldProvider,
}

impl<'a> Fold<'a> {
    fn new(max_df: Option<usize>, yielder: &'a mut dyn YieldProvider) -> Self {
        Fold {
            table: PostingsTable::default(),
            guard: DfGuard::new(max_df),
            current: None,
            rows: 0,
            yielder,
        }
    }

    fn push(&mut self, row: PostingRow) {
        self.yielder.tick();
        if row.key.is_empty() {
            return;
        }
        self.rows += 1;
        let ids = row.postings.into_ids();
        match self.current.as_mut() {
            Some((key, list)) if *key == row.key => {
                *list = merge_id_lists(std::mem::take(list), &ids);
            }
            _ => {
                self.flush();
                self.current = Some((row.key, ids));
            }
        }
    }

    fn flush(&mut self) {
        let Some((key, list)) = self.current.take() else {
            return;
        };
        let list = normalize_id_list(&list);
        if list.is_empty() {
            return;
        }
        if let Some(list) = self.guard.admit(list) {
            self.table.vocab.push(key);
            self.table.postings.push(list);
        }
    }

    fn consume<I: IntoIterator<Item = Result<PostingRow>>>(&mut self, rows: I) -> Result<()> {
        for row in rows {
            self.push(row?);
        }
        Ok(())
    }

    fn finish(mut self, stats: &mut SpillStats) -> PostingsTable {
        self.flush();
        stats.dropped_high_df = self.guard.dropped_high_df();
        stats.max_df = self.guard.max_df_observed();
        self.table
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {e}", path.display());
        }
    }
}

fn remove_dir_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {e}", path.display());
        }
    }
}

/// Merge spilled runs and fold them.
fn merge_runs(
    ctx: &SpillContext,
    runs: &RunSet,
    spill_dir: &Path,
    comparator: &RowComparator<PostingRow>,
    options: &BuildOptions,
    fold: &mut Fold<'_>,
) -> Result<PostingsMergeStats> {
    let started = Instant::now();
    let mut stats = PostingsMergeStats {
        runs: runs.len(),
        ..Default::default()
    };

    if runs.len() <= options.max_open_runs {
        fold.consume(merge_sorted_runs(runs.runs(), comparator)?)?;
        stats.bytes = runs.total_bytes();
        stats.runs_merged = runs.len() as u64;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        return Ok(stats);
    }

    let merge_dir = spill_dir.join(format!("{}.merge", options.label));
    let merged_path = merge_dir.join(format!("{}.merged.jsonl", options.label));
    let planner_options = PlannerOptions {
        max_open_runs: options.max_open_runs,
        temp_dir: Some(merge_dir.clone()),
        run_prefix: options.label.clone(),
        checkpoint_path: Some(merge_dir.join(format!("{}.checkpoint.json", options.label))),
        write: options.write.clone(),
        hints: options.hints.clone(),
        ..PlannerOptions::new(&merged_path)
    };
    // Spill runs are fresh for every build, so nothing under the merge dir can
    // be resumed.
    remove_dir_quietly(&merge_dir);
    let mut outcome =
        match merge_runs_with_planner(ctx, runs.runs(), comparator, &planner_options) {
            Ok(outcome) => outcome,
            Err(e) => {
                remove_dir_quietly(&merge_dir);
                return Err(e);
            }
        };

    let folded = read_run(&merged_path).and_then(|rows| fold.consume(rows));
    remove_quietly(&merged_path);
    let cleaned = outcome.cleanup.cleanup();
    remove_dir_quietly(&merge_dir);
    folded?;
    cleaned?;

    stats.bytes = outcome.stats.bytes;
    stats.planner_used = true;
    stats.planner_hint_used = outcome.hint_used;
    stats.passes = outcome.stats.passes;
    stats.runs_merged = outcome.stats.runs_merged;
    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Drain `source` into a sorted postings table.
///
/// The map is emptied. Rows with an empty key and lists that normalize to empty
/// are skipped. Every spill file is removed before returning, on success and
/// on error alike.
pub fn build_id_postings(
    ctx: &SpillContext,
    source: &mut PostingsMap,
    options: &BuildOptions,
    yielder: &mut dyn YieldProvider,
) -> Result<BuiltPostings> {
    if options.max_open_runs < 2 {
        return Err(SpillError::invalid_argument(format!(
            "max_open_runs must be at least 2, got {}",
            options.max_open_runs
        )));
    }

    let mut spill_stats = SpillStats {
        peak_unique: source.len(),
        ..Default::default()
    };
    let spill_by_unique = options
        .spill_max_unique
        .is_some_and(|m| m > 0 && source.len() >= m);
    let spill_by_bytes =
        options.spill_dir.is_some() && should_spill_by_bytes(source, options.spill_max_bytes)?;
    let spill = options.spill_dir.is_some() && (spill_by_unique || spill_by_bytes);
    spill_stats.spill_enabled = spill;
    if spill {
        log::debug!(
            "{}: spilling {} keys (by unique: {spill_by_unique}, by bytes: {spill_by_bytes})",
            options.label,
            source.len()
        );
    }

    let comparator = RowComparator::by_key().validated(options.validate_comparator);
    let collect_options = CollectOptions {
        spill_dir: spill.then(|| options.spill_dir.clone()).flatten(),
        run_prefix: options.label.clone(),
        max_buffer_rows: options.spill_buffer_rows,
        max_buffer_bytes: options.spill_buffer_bytes,
        max_spill_unique: None,
        max_spill_bytes: None,
        force_spill: spill,
        write: options.write.clone(),
    };
    let (collected, collect_stats) =
        collect_rows(ctx, source, &comparator, &collect_options, yielder)?;

    let mut fold = Fold::new(options.max_df, yielder);
    let merge_stats = match collected {
        Collected::Rows(rows) => {
            fold.consume(rows.into_iter().map(Ok))?;
            None
        }
        Collected::Runs(mut runs) => {
            spill_stats.spill_runs = runs.len();
            spill_stats.spill_rows = collect_stats.total_rows;
            spill_stats.spill_bytes = collect_stats.total_bytes;
            spill_stats.spill_max_row_bytes = collect_stats.max_row_bytes;

            let spill_dir = collect_options.spill_dir.as_deref().unwrap_or(Path::new("."));
            let merged = merge_runs(ctx, &runs, spill_dir, &comparator, options, &mut fold);
            let cleaned = runs.cleanup();
            let mut stats = merged?;
            cleaned?;
            stats.rows = fold.rows;
            Some(stats)
        }
    };

    let table = fold.finish(&mut spill_stats);
    log::debug!(
        "{}: built {} keys ({} dropped by df)",
        options.label,
        table.len(),
        spill_stats.dropped_high_df
    );
    Ok(BuiltPostings {
        table,
        merge_stats,
        spill_stats,
    })
}

/// Sorted vocabulary with one term-frequency list per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfPostingsTable {
    pub vocab: Vec<String>,
    pub postings: Vec<Vec<TfPosting>>,
}

/// Drain a token map into a key-sorted term-frequency table.
///
/// Id-only lists count each document once. Empty keys are skipped.
pub fn build_tf_postings(
    source: &mut PostingsMap,
    yielder: &mut dyn YieldProvider,
) -> TfPostingsTable {
    let mut entries: Vec<(String, Postings)> =
        source.drain().filter(|(k, _)| !k.is_empty()).collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut table = TfPostingsTable {
        vocab: Vec::with_capacity(entries.len()),
        postings: Vec::with_capacity(entries.len()),
    };
    for (key, postings) in entries {
        let list = match postings.normalized() {
            Postings::Tf(list) => list,
            Postings::Ids(ids) => ids.into_iter().map(|id| (id, 1)).collect(),
        };
        table.vocab.push(key);
        table.postings.push(list);
        yielder.tick();
    }
    table
}
