//! Merging sorted runs.
//!
//! - [`engine`]: deterministic k-way merge driven by a [`heap::MinHeap`]
//! - [`planner`]: multi-pass merging under an open-run budget
//! - [`checkpoint`]: resumable planner progress
//! - [`hints`]: optional cache of earlier pass layouts

pub mod checkpoint;
pub mod engine;
pub mod heap;
pub mod hints;
pub mod planner;

pub use engine::{
    MergeStats, MergedRows, RowComparator, merge_sorted_runs, merge_sorted_runs_to_file,
    merge_sorted_runs_to_file_with, merge_sorted_runs_with,
};
pub use planner::{
    DEFAULT_MAX_OPEN_RUNS, HintOptions, MergeCleanup, PlannerOptions, PlannerOutcome, PlannerStats,
    merge_runs_with_planner, merge_runs_with_planner_with,
};
