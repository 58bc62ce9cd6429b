//! Crash-safe file output.
//!
//! Every artifact the engine produces (run files, merged output, manifests,
//! checkpoints) is first written to a sibling temp path and then committed with
//! [`atomic::replace_file_atomic`]. A reader therefore only ever observes the old
//! file or the complete new one.
//!
//! # Architecture
//!
//! - **FileOps trait**: the filesystem seam used by the committer
//! - **replace_file_atomic**: temp-then-rename replacement with backup/restore
//! - **AtomicJsonlWriter**: buffered line writer that commits on close

pub mod atomic;
pub mod writer;

pub use atomic::{
    FileOps, ReplaceOptions, StdFileOps, replace_file_atomic,
    replace_file_atomic_with,
};
pub use writer::{
    AtomicJsonlWriter, WriteOptions, WriteOutcome, write_json_file_atomic, write_jsonl_atomic,
};
