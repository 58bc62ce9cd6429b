//! # postings-spill
//!
//! External merge sort for search postings.
//!
//! ## Features
//!
//! - Posting list normalization and merging
//! - Adaptive in-memory or spill-to-disk row collection
//! - Deterministic k-way merge of sorted JSONL runs
//! - Multi-pass merge planning with resumable checkpoints
//! - Crash-safe atomic file replacement

pub mod build;
pub mod cli;
pub mod collector;
pub mod config;
pub mod context;
pub mod cooperative;
pub mod error;
pub mod merge;
pub mod postings;
pub mod run;
pub mod storage;

pub mod prelude {
    pub use crate::build::{BuildOptions, BuiltPostings, PostingsTable, build_id_postings};
    pub use crate::collector::{CollectOptions, Collected, RowSpillCollector, collect_rows};
    pub use crate::config::PostingsConfig;
    pub use crate::context::SpillContext;
    pub use crate::error::{Result, SpillError};
    pub use crate::merge::{
        MergeCleanup, PlannerOptions, RowComparator, merge_runs_with_planner, merge_sorted_runs,
    };
    pub use crate::postings::{DocId, PostingRow, Postings, PostingsMap};
    pub use crate::storage::{ReplaceOptions, WriteOptions, replace_file_atomic};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
