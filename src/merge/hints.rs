//! Planner hint cache.
//!
//! Remembers the pass layout and cost of earlier merges keyed by a fingerprint
//! of their inputs. A hit lets the planner skip estimating the plan. Hints never
//! change what is merged or in which order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::Result;
use crate::run::RUN_SCHEMA_VERSION;
use crate::storage::atomic::ReplaceOptions;
use crate::storage::writer::write_json_file_atomic;

/// Pass layout for a multi-pass merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub run_count: usize,
    pub max_open_runs: usize,
    /// Number of intermediate runs produced by each pass.
    pub groups_per_pass: Vec<usize>,
}

impl MergePlan {
    pub fn estimate(run_count: usize, max_open_runs: usize) -> Self {
        let fan_in = max_open_runs.max(2);
        let mut groups_per_pass = Vec::new();
        let mut remaining = run_count;
        while remaining > fan_in {
            remaining = remaining.div_ceil(fan_in);
            groups_per_pass.push(remaining);
        }
        MergePlan {
            run_count,
            max_open_runs: fan_in,
            groups_per_pass,
        }
    }

    /// Intermediate passes before the final merge.
    pub fn passes(&self) -> usize {
        self.groups_per_pass.len()
    }

    /// Runs read across all passes, the final merge included.
    pub fn runs_merged(&self) -> usize {
        self.run_count + self.groups_per_pass.iter().sum::<usize>()
    }
}

/// Recorded outcome of a previous merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerHint {
    pub plan: MergePlan,
    pub rows: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub recorded_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HintFile {
    version: u32,
    entries: BTreeMap<String, PlannerHint>,
}

/// Stable fingerprint of `(label, run names and sizes, input key)`.
pub fn fingerprint<P: AsRef<Path>>(label: &str, runs: &[P], input_key: Option<&str>) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(label.as_bytes());
    hasher.update(&[0]);
    for run in runs {
        let path = run.as_ref();
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        hasher.update(name.as_bytes());
        hasher.update(&size.to_le_bytes());
    }
    hasher.update(&[0]);
    if let Some(key) = input_key {
        hasher.update(key.as_bytes());
    }
    format!("{label}:{}:{:08x}", runs.len(), hasher.finalize())
}

/// JSON-file backed hint store.
#[derive(Debug)]
pub struct PlannerHintCache {
    path: PathBuf,
    entries: BTreeMap<String, PlannerHint>,
}

impl PlannerHintCache {
    /// Open the cache at `path`. Missing or unreadable files start empty.
    pub fn open(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HintFile>(&raw) {
                Ok(file) if file.version == RUN_SCHEMA_VERSION => file.entries,
                Ok(_) => BTreeMap::new(),
                Err(e) => {
                    log::warn!("ignoring corrupt planner hints {}: {e}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        PlannerHintCache {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&PlannerHint> {
        self.entries.get(fingerprint)
    }

    pub fn record(&mut self, fingerprint: String, plan: MergePlan, rows: u64, bytes: u64, elapsed_ms: u64) {
        self.entries.insert(
            fingerprint,
            PlannerHint {
                plan,
                rows,
                bytes,
                elapsed_ms,
                recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, ctx: &SpillContext, options: &ReplaceOptions) -> Result<()> {
        let file = HintFile {
            version: RUN_SCHEMA_VERSION,
            entries: self.entries.clone(),
        };
        write_json_file_atomic(ctx, &self.path, &file, options)?;
        Ok(())
    }
}
