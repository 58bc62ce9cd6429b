//! Resumable progress for multi-pass merges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::Result;
use crate::run::RUN_SCHEMA_VERSION;
use crate::storage::atomic::ReplaceOptions;
use crate::storage::writer::write_json_file_atomic;

/// A completed intermediate merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Completed groups, keyed by pass index and then group index.
///
/// `inputs` fingerprints the runs the merge started from; a checkpoint written
/// for other inputs is never resumed.
///
/// ```json
/// {
///   "version": 1,
///   "createdAt": "2026-01-01T00:00:00.000Z",
///   "inputs": "merge:4:1c291ca3",
///   "passes": { "0": { "0": { "path": "...", "manifestPath": "..." } } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<String>,
    pub passes: BTreeMap<u32, BTreeMap<u32, CheckpointEntry>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    pub fn new() -> Self {
        Checkpoint {
            version: RUN_SCHEMA_VERSION,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            inputs: None,
            passes: BTreeMap::new(),
        }
    }

    pub fn for_inputs(inputs: impl Into<String>) -> Self {
        Checkpoint {
            inputs: Some(inputs.into()),
            ..Self::new()
        }
    }

    /// Load a checkpoint.
    ///
    /// A missing, unreadable or wrong-version file yields `None`; the merge then
    /// starts from scratch.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("ignoring unreadable checkpoint {}: {e}", path.display());
                }
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(checkpoint) if checkpoint.version == RUN_SCHEMA_VERSION => Some(checkpoint),
            Ok(checkpoint) => {
                log::warn!(
                    "ignoring checkpoint {} with version {}",
                    path.display(),
                    checkpoint.version
                );
                None
            }
            Err(e) => {
                log::warn!("ignoring corrupt checkpoint {}: {e}", path.display());
                None
            }
        }
    }

    /// Load a checkpoint only if it was written for `inputs`.
    pub fn load_for(path: &Path, inputs: &str) -> Option<Self> {
        let checkpoint = Self::load(path)?;
        if checkpoint.inputs.as_deref() == Some(inputs) {
            return Some(checkpoint);
        }
        log::warn!(
            "ignoring checkpoint {} written for other inputs ({})",
            path.display(),
            checkpoint.inputs.as_deref().unwrap_or("unknown")
        );
        None
    }

    pub fn save(&self, ctx: &SpillContext, path: &Path, options: &ReplaceOptions) -> Result<()> {
        write_json_file_atomic(ctx, path, self, options)?;
        Ok(())
    }

    /// Recorded entry for `(pass, group)`, only if its run still exists.
    pub fn completed(&self, pass: u32, group: u32) -> Option<&CheckpointEntry> {
        self.passes
            .get(&pass)
            .and_then(|groups| groups.get(&group))
            .filter(|entry| entry.path.exists())
    }

    pub fn record(&mut self, pass: u32, group: u32, entry: CheckpointEntry) {
        self.passes.entry(pass).or_default().insert(group, entry);
    }

    /// Every run and manifest path the checkpoint references.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.passes
            .values()
            .flat_map(|groups| groups.values())
            .flat_map(|entry| [entry.path.as_path(), entry.manifest_path.as_path()])
    }
}
