//! Multi-pass merge planning.
//!
//! When more runs exist than may be open at once, runs are merged in groups of
//! `max_open_runs` into intermediate runs in a scratch directory, pass after pass,
//! until one final merge fits the budget. Each completed group is recorded in a
//! checkpoint so an interrupted merge resumes where it stopped.
//!
//! Intermediate files stay on disk until [`MergeCleanup::cleanup`] runs. A failed
//! merge returns no guard, so its intermediates and checkpoint survive for the
//! next attempt.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::{Result, SpillError};
use crate::merge::checkpoint::{Checkpoint, CheckpointEntry};
use crate::merge::engine::{RowComparator, merge_sorted_runs_to_file_with};
use crate::merge::hints::{MergePlan, PlannerHintCache, fingerprint};
use crate::run::{JsonlRunSource, RunManifest, RunSource, manifest_path_for, write_manifest};
use crate::storage::writer::WriteOptions;

/// Default open-run budget.
pub const DEFAULT_MAX_OPEN_RUNS: usize = 64;

/// Where the planner hint cache lives and how inputs are labelled.
#[derive(Debug, Clone)]
pub struct HintOptions {
    pub cache_path: PathBuf,
    pub label: String,
    /// Caller-supplied key distinguishing otherwise identical inputs.
    pub input_key: Option<String>,
}

/// Options for [`merge_runs_with_planner`].
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    pub output_path: PathBuf,
    pub max_open_runs: usize,
    /// Scratch directory for intermediate runs. Defaults to the output's parent.
    pub temp_dir: Option<PathBuf>,
    pub run_prefix: String,
    pub checkpoint_path: Option<PathBuf>,
    pub write: WriteOptions,
    pub hints: Option<HintOptions>,
}

impl PlannerOptions {
    pub fn new<P: Into<PathBuf>>(output_path: P) -> Self {
        PlannerOptions {
            output_path: output_path.into(),
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
            temp_dir: None,
            run_prefix: "merge".to_string(),
            checkpoint_path: None,
            write: WriteOptions::default(),
            hints: None,
        }
    }

    fn scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        match self.output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `<prefix>.pass-PP.run-GGG.jsonl` in the scratch directory.
    pub fn intermediate_run_path(&self, pass: u32, group: u32) -> PathBuf {
        self.scratch_dir()
            .join(format!("{}.pass-{pass:02}.run-{group:03}.jsonl", self.run_prefix))
    }
}

/// Statistics for a planned merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerStats {
    pub rows: u64,
    pub bytes: u64,
    pub max_row_bytes: u64,
    pub checksum: u32,
    /// Intermediate passes, excluding the final merge.
    pub passes: u32,
    /// Runs read by merges performed in this invocation.
    pub runs_merged: u64,
    /// Intermediate groups taken from the checkpoint instead of re-merged.
    pub groups_reused: u64,
    pub elapsed_ms: u64,
}

/// Result of [`merge_runs_with_planner`].
#[derive(Debug)]
pub struct PlannerOutcome {
    pub output_path: PathBuf,
    pub stats: PlannerStats,
    pub plan: MergePlan,
    pub hint_used: bool,
    pub cleanup: MergeCleanup,
}

/// Removes a planner's intermediate runs, manifests, checkpoint and scratch
/// directory.
///
/// [`cleanup`](Self::cleanup) may be called any number of times. Anything still
/// pending when the guard drops is removed on a best-effort basis.
#[derive(Debug, Default)]
pub struct MergeCleanup {
    paths: Vec<PathBuf>,
    checkpoint: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    done: bool,
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl MergeCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track another file for removal.
    pub fn add_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.paths.push(path.into());
        self.done = false;
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop tracking everything and return the files that would have been
    /// removed. Nothing is deleted afterwards, not even on drop.
    pub fn keep(&mut self) -> Vec<PathBuf> {
        let mut kept = std::mem::take(&mut self.paths);
        kept.extend(self.checkpoint.take());
        self.scratch_dir = None;
        self.done = true;
        kept
    }

    pub fn cleanup(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }

        let mut first_error = None;
        self.paths.retain(|path| match remove_if_present(path) {
            Ok(()) => false,
            Err(e) => {
                first_error.get_or_insert_with(|| SpillError::file_io(path, e));
                true
            }
        });

        if let Some(checkpoint) = self.checkpoint.take() {
            if let Err(e) = remove_if_present(&checkpoint) {
                first_error.get_or_insert_with(|| SpillError::file_io(&checkpoint, e));
                self.checkpoint = Some(checkpoint);
            }
        }

        // Only an empty directory is removed; callers may share the scratch dir.
        if let Some(dir) = self.scratch_dir.take() {
            if let Err(e) = std::fs::remove_dir(&dir) {
                log::debug!("keeping scratch dir {}: {e}", dir.display());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.done = true;
                Ok(())
            }
        }
    }
}

impl Drop for MergeCleanup {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("merge cleanup failed: {e}");
        }
    }
}

/// Merge JSONL runs into `options.output_path` with at most
/// `options.max_open_runs` runs open at a time.
pub fn merge_runs_with_planner<T, P>(
    ctx: &SpillContext,
    runs: &[P],
    comparator: &RowComparator<T>,
    options: &PlannerOptions,
) -> Result<PlannerOutcome>
where
    T: Serialize + DeserializeOwned + 'static,
    P: AsRef<Path>,
{
    merge_runs_with_planner_with(ctx, &JsonlRunSource, runs, comparator, options)
}

/// [`merge_runs_with_planner`] reading runs through `source`.
pub fn merge_runs_with_planner_with<T, P>(
    ctx: &SpillContext,
    source: &dyn RunSource<T>,
    runs: &[P],
    comparator: &RowComparator<T>,
    options: &PlannerOptions,
) -> Result<PlannerOutcome>
where
    T: Serialize + 'static,
    P: AsRef<Path>,
{
    if runs.is_empty() {
        return Err(SpillError::invalid_argument("planner requires at least one run"));
    }
    let max_open = options.max_open_runs;
    if max_open < 2 {
        return Err(SpillError::invalid_argument(format!(
            "max_open_runs must be at least 2, got {max_open}"
        )));
    }

    let started = Instant::now();
    let scratch = options.scratch_dir();
    let created_scratch = !scratch.exists();
    std::fs::create_dir_all(&scratch).map_err(|e| SpillError::file_io(&scratch, e))?;

    let mut hint_cache = options.hints.as_ref().map(|h| {
        let key = fingerprint(&h.label, runs, h.input_key.as_deref());
        (PlannerHintCache::open(&h.cache_path), key)
    });
    let hinted = hint_cache.as_ref().and_then(|(cache, key)| {
        cache
            .get(key)
            .filter(|hint| hint.plan.run_count == runs.len() && hint.plan.max_open_runs == max_open)
            .map(|hint| hint.plan.clone())
    });
    let hint_used = hinted.is_some();
    let plan = hinted.unwrap_or_else(|| MergePlan::estimate(runs.len(), max_open));

    let mut cleanup = MergeCleanup {
        paths: Vec::new(),
        checkpoint: options.checkpoint_path.clone(),
        scratch_dir: created_scratch.then(|| scratch.clone()),
        done: false,
    };
    let mut stats = PlannerStats::default();
    let groups_per_pass = match run_passes(
        ctx,
        source,
        runs,
        comparator,
        options,
        &plan,
        hint_used,
        &mut cleanup,
        &mut stats,
    ) {
        Ok(groups_per_pass) => groups_per_pass,
        Err(e) => {
            let left = cleanup.keep();
            log::info!("merge failed, keeping {} files for resume", left.len());
            return Err(e);
        }
    };
    stats.elapsed_ms = started.elapsed().as_millis() as u64;

    if let Some((cache, key)) = hint_cache.as_mut() {
        let observed = MergePlan {
            run_count: runs.len(),
            max_open_runs: max_open,
            groups_per_pass,
        };
        if observed != plan {
            log::debug!("planner hint {key} did not match the observed passes");
        }
        cache.record(key.clone(), observed, stats.rows, stats.bytes, stats.elapsed_ms);
        if let Err(e) = cache.save(ctx, &options.write.replace) {
            ctx.warn_once("planner-hints", &format!("could not save planner hints: {e}"));
        }
    }

    Ok(PlannerOutcome {
        output_path: options.output_path.clone(),
        stats,
        plan,
        hint_used,
        cleanup,
    })
}

/// Intermediate passes followed by the final merge. Returns the number of runs
/// produced by each intermediate pass.
#[allow(clippy::too_many_arguments)]
fn run_passes<T, P>(
    ctx: &SpillContext,
    source: &dyn RunSource<T>,
    runs: &[P],
    comparator: &RowComparator<T>,
    options: &PlannerOptions,
    plan: &MergePlan,
    hint_used: bool,
    cleanup: &mut MergeCleanup,
    stats: &mut PlannerStats,
) -> Result<Vec<usize>>
where
    T: Serialize + 'static,
    P: AsRef<Path>,
{
    let max_open = options.max_open_runs;
    let mut groups_per_pass = Vec::with_capacity(plan.passes());

    let mut current: Vec<PathBuf> = runs.iter().map(|r| r.as_ref().to_path_buf()).collect();
    if current.len() > max_open {
        log::info!(
            "merging {} runs in {} passes (max {} open{})",
            current.len(),
            plan.passes(),
            max_open,
            if hint_used { ", from hint" } else { "" }
        );

        let inputs = fingerprint(&options.run_prefix, runs, None);
        let resumed = options
            .checkpoint_path
            .as_deref()
            .and_then(|path| Checkpoint::load_for(path, &inputs));
        let mut checkpoint = match resumed {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::for_inputs(inputs),
        };
        let mut pass: u32 = 0;

        while current.len() > max_open {
            let mut next = Vec::with_capacity(current.len().div_ceil(max_open));
            for (group_index, group) in current.chunks(max_open).enumerate() {
                let group_index = group_index as u32;
                if let Some(entry) = checkpoint.completed(pass, group_index) {
                    log::debug!(
                        "pass {pass} group {group_index}: reusing {}",
                        entry.path.display()
                    );
                    cleanup.add_path(entry.path.clone());
                    cleanup.add_path(entry.manifest_path.clone());
                    next.push(entry.path.clone());
                    stats.groups_reused += 1;
                    continue;
                }

                let run_path = options.intermediate_run_path(pass, group_index);
                let manifest_path = manifest_path_for(&run_path);
                let merged = merge_sorted_runs_to_file_with(
                    ctx,
                    source,
                    group,
                    &run_path,
                    comparator,
                    &options.write,
                )?;
                cleanup.add_path(run_path.clone());
                stats.runs_merged += group.len() as u64;

                let manifest = RunManifest::new(&run_path, merged.rows, merged.bytes)
                    .with_compare_id(comparator.id())
                    .with_sources(group);
                write_manifest(ctx, &manifest_path, &manifest, &options.write)?;
                cleanup.add_path(manifest_path.clone());

                checkpoint.record(
                    pass,
                    group_index,
                    CheckpointEntry {
                        path: run_path.clone(),
                        manifest_path,
                    },
                );
                if let Some(checkpoint_path) = &options.checkpoint_path {
                    checkpoint.save(ctx, checkpoint_path, &options.write.replace)?;
                }
                next.push(run_path);
            }

            log::info!("merge pass {pass}: {} runs -> {}", current.len(), next.len());
            groups_per_pass.push(next.len());
            current = next;
            pass += 1;
        }
        stats.passes = pass;
    }

    let final_stats = merge_sorted_runs_to_file_with(
        ctx,
        source,
        &current,
        &options.output_path,
        comparator,
        &options.write,
    )?;
    stats.runs_merged += current.len() as u64;
    stats.rows = final_stats.rows;
    stats.bytes = final_stats.bytes;
    stats.max_row_bytes = final_stats.max_row_bytes;
    stats.checksum = final_stats.checksum;
    Ok(groups_per_pass)
}
