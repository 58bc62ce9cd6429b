//! Adaptive row collection with spill to sorted runs.
//!
//! Rows are buffered in memory until the collection is known or observed to be
//! too large: either the expected row count reaches `max_spill_unique`, or the
//! running serialized size reaches `max_spill_bytes`. From then on the buffer is
//! sorted and written out as a run whenever it reaches `max_buffer_rows` or
//! `max_buffer_bytes`, so the source is traversed exactly once.
//!
//! Small collections come back as one sorted `Vec`; spilled ones as a
//! [`RunSet`] ready for merging.

use std::mem;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::cooperative::YieldProvider;
use crate::error::{Result, SpillError};
use crate::merge::engine::RowComparator;
use crate::postings::{DocId, PostingRow, PostingsMap};
use crate::run::{RunFile, write_run_file};
use crate::storage::writer::WriteOptions;

/// Default per-run row bound once spilling.
pub const DEFAULT_SPILL_BUFFER_ROWS: usize = 5000;

/// Default per-run byte bound once spilling.
pub const DEFAULT_SPILL_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Options for [`RowSpillCollector`] and [`collect_rows`].
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Directory for spill runs. Without one the collector never spills.
    pub spill_dir: Option<PathBuf>,
    pub run_prefix: String,
    pub max_buffer_rows: usize,
    pub max_buffer_bytes: usize,
    /// Spill once this many rows are expected or buffered. Zero disables.
    pub max_spill_unique: Option<usize>,
    /// Spill once this many serialized bytes have been collected. Zero disables.
    pub max_spill_bytes: Option<usize>,
    /// Spill from the first row, e.g. after an up-front size estimate.
    pub force_spill: bool,
    pub write: WriteOptions,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            spill_dir: None,
            run_prefix: "spill".to_string(),
            max_buffer_rows: DEFAULT_SPILL_BUFFER_ROWS,
            max_buffer_bytes: DEFAULT_SPILL_BUFFER_BYTES,
            max_spill_unique: None,
            max_spill_bytes: None,
            force_spill: false,
            write: WriteOptions::default(),
        }
    }
}

/// Totals over every collected row. Byte counts include the line terminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectStats {
    pub total_rows: u64,
    pub total_bytes: u64,
    pub max_row_bytes: u64,
}

/// Spill runs owned by the caller.
///
/// The run files are deleted by [`cleanup`](Self::cleanup) or when the set is
/// dropped.
#[derive(Debug, Default)]
pub struct RunSet {
    runs: Vec<RunFile>,
}

impl RunSet {
    pub fn runs(&self) -> &[RunFile] {
        &self.runs
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.runs.iter().map(|r| r.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.runs.iter().map(|r| r.rows).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.runs.iter().map(|r| r.bytes).sum()
    }

    fn push(&mut self, run: RunFile) {
        self.runs.push(run);
    }

    /// Delete every run file. Safe to call repeatedly.
    pub fn cleanup(&mut self) -> Result<()> {
        let mut first_error = None;
        self.runs.retain(|run| match std::fs::remove_file(&run.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                first_error.get_or_insert_with(|| SpillError::file_io(&run.path, e));
                true
            }
            _ => false,
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for RunSet {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("spill run cleanup failed: {e}");
        }
    }
}

/// Outcome of a collection.
#[derive(Debug)]
pub enum Collected<T> {
    /// Everything fit in memory; rows are sorted.
    Rows(Vec<T>),
    /// Rows were spilled to sorted runs.
    Runs(RunSet),
}

/// Buffers rows and spills sorted runs when thresholds are crossed.
pub struct RowSpillCollector<'a, T> {
    ctx: &'a SpillContext,
    comparator: RowComparator<T>,
    options: CollectOptions,
    buffer: Vec<T>,
    buffer_bytes: usize,
    spilling: bool,
    runs: RunSet,
    stats: CollectStats,
    line: Vec<u8>,
}

impl<'a, T: Serialize> RowSpillCollector<'a, T> {
    pub fn new(ctx: &'a SpillContext, comparator: RowComparator<T>, options: CollectOptions) -> Self {
        RowSpillCollector {
            ctx,
            comparator,
            options,
            buffer: Vec::new(),
            buffer_bytes: 0,
            spilling: false,
            runs: RunSet::default(),
            stats: CollectStats::default(),
            line: Vec::with_capacity(256),
        }
    }

    /// Declare how many rows will be appended. Reaching `max_spill_unique`
    /// switches the collector into spill mode before the first row.
    pub fn with_expected_rows(mut self, expected: usize) -> Self {
        let over_unique = self
            .options
            .max_spill_unique
            .is_some_and(|m| m > 0 && expected >= m);
        if self.can_spill() && over_unique {
            log::debug!(
                "{}: spilling {expected} rows by cardinality",
                self.options.run_prefix
            );
            self.spilling = true;
        }
        self
    }

    /// Start in spill mode regardless of thresholds. No-op without a spill dir.
    pub fn start_spilling(mut self) -> Self {
        self.spilling = self.can_spill();
        self
    }

    fn can_spill(&self) -> bool {
        self.options.spill_dir.is_some()
    }

    pub fn is_spilling(&self) -> bool {
        self.spilling
    }

    pub fn stats(&self) -> CollectStats {
        self.stats
    }

    pub fn append(&mut self, row: T) -> Result<()> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, &row)?;
        let row_bytes = self.line.len() + 1;

        self.stats.total_rows += 1;
        self.stats.total_bytes += row_bytes as u64;
        self.stats.max_row_bytes = self.stats.max_row_bytes.max(row_bytes as u64);
        self.buffer.push(row);
        self.buffer_bytes += row_bytes;

        if !self.spilling {
            let over_unique = self
                .options
                .max_spill_unique
                .is_some_and(|m| m > 0 && self.buffer.len() >= m);
            let over_bytes = self
                .options
                .max_spill_bytes
                .is_some_and(|m| m > 0 && self.stats.total_bytes >= m as u64);
            if self.can_spill() && (over_unique || over_bytes) {
                log::debug!(
                    "{}: spilling after {} rows ({} bytes)",
                    self.options.run_prefix,
                    self.stats.total_rows,
                    self.stats.total_bytes
                );
                self.spilling = true;
                self.spill()?;
            }
            return Ok(());
        }

        if self.buffer.len() >= self.options.max_buffer_rows.max(1)
            || self.buffer_bytes >= self.options.max_buffer_bytes.max(1)
        {
            self.spill()?;
        }
        Ok(())
    }

    /// Sort the buffer and write it out as the next run.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(dir) = self.options.spill_dir.as_ref() else {
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| SpillError::file_io(dir, e))?;
        let path = dir.join(format!(
            "{}.run-{:05}.jsonl",
            self.options.run_prefix,
            self.runs.len()
        ));

        self.comparator.sort(&mut self.buffer)?;
        let run = write_run_file(self.ctx, &path, self.buffer.drain(..), &self.options.write)?;
        log::debug!("spilled {} rows to {}", run.rows, path.display());
        self.runs.push(run);
        self.buffer_bytes = 0;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<(Collected<T>, CollectStats)> {
        if self.runs.is_empty() && !self.spilling {
            self.comparator.sort(&mut self.buffer)?;
            return Ok((Collected::Rows(self.buffer), self.stats));
        }
        self.spill()?;
        Ok((Collected::Runs(mem::take(&mut self.runs)), self.stats))
    }
}

/// Drain `source` into sorted rows or spill runs.
///
/// Postings are normalized on the way in. The map is empty afterwards.
pub fn collect_rows(
    ctx: &SpillContext,
    source: &mut PostingsMap,
    comparator: &RowComparator<PostingRow>,
    options: &CollectOptions,
    yielder: &mut dyn YieldProvider,
) -> Result<(Collected<PostingRow>, CollectStats)> {
    let mut collector = RowSpillCollector::new(ctx, comparator.clone(), options.clone())
        .with_expected_rows(source.len());
    if options.force_spill {
        collector = collector.start_spilling();
    }
    for (key, postings) in source.drain() {
        collector.append(PostingRow::new(key, postings.normalized()))?;
        yielder.tick();
    }
    collector.finalize()
}

/// Drops posting lists longer than `max_df` and keeps count.
///
/// Dropped lists still count towards [`max_df_observed`](Self::max_df_observed).
#[derive(Debug, Clone, Default)]
pub struct DfGuard {
    max_df: Option<usize>,
    dropped_high_df: u64,
    max_df_observed: usize,
}

impl DfGuard {
    /// `None` or `Some(0)` disables the limit.
    pub fn new(max_df: Option<usize>) -> Self {
        DfGuard {
            max_df: max_df.filter(|m| *m > 0),
            ..Default::default()
        }
    }

    pub fn admit(&mut self, list: Vec<DocId>) -> Option<Vec<DocId>> {
        self.max_df_observed = self.max_df_observed.max(list.len());
        match self.max_df {
            Some(max_df) if list.len() > max_df => {
                self.dropped_high_df += 1;
                None
            }
            _ => Some(list),
        }
    }

    pub fn dropped_high_df(&self) -> u64 {
        self.dropped_high_df
    }

    pub fn max_df_observed(&self) -> usize {
        self.max_df_observed
    }
}
