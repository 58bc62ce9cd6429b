//! Process-scoped state shared by spill, merge and commit operations.
//!
//! A [`SpillContext`] replaces module-level counters. It is passed by reference
//! into every operation that allocates temp paths or emits deduplicated warnings,
//! so independent builds (and tests) can each own an isolated context.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

/// Allocates collision-resistant sibling temp paths.
///
/// Tokens combine the process id, a nanosecond timestamp, a per-allocator counter
/// and random bits, so two writers targeting the same final path never share a
/// temp file.
#[derive(Debug, Default)]
pub struct TempPathAllocator {
    counter: AtomicU32,
}

impl TempPathAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next unique token.
    pub fn next_token(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let random = Uuid::new_v4().simple().to_string();
        format!("{}-{nanos:x}-{counter:08x}-{}", process::id(), &random[..12])
    }

    /// Sibling temp path for `final_path`: `<final>.tmp-<token>`.
    pub fn temp_path_for(&self, final_path: &Path) -> PathBuf {
        let mut name: OsString = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp-{}", self.next_token()));
        final_path.with_file_name(name)
    }
}

/// Process-scoped context for spill operations.
#[derive(Debug, Default)]
pub struct SpillContext {
    temp_paths: TempPathAllocator,
    warned: Mutex<HashSet<String>>,
}

impl SpillContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temp_paths(&self) -> &TempPathAllocator {
        &self.temp_paths
    }

    /// Log `message` at warn level the first time `key` is seen in this context.
    ///
    /// Returns `true` if the warning was emitted.
    pub fn warn_once(&self, key: &str, message: &str) -> bool {
        let mut warned = self.warned.lock();
        if warned.contains(key) {
            return false;
        }
        warned.insert(key.to_string());
        log::warn!("{message}");
        true
    }
}
