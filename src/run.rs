//! Run files: sorted rows persisted as JSONL.
//!
//! A run is immutable once committed. Each line holds one JSON row and ends with
//! `\n`; nothing follows the last line. Runs can carry a `<run>.meta.json`
//! manifest recording where they came from.
//!
//! ```jsonl
//! {"key":"ab","postings":[1,4]}
//! {"key":"ac","postings":[2]}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::{Result, SpillError};
use crate::storage::writer::{WriteOptions, write_json_file_atomic, write_jsonl_atomic};

/// On-disk format tag recorded in manifests.
pub const RUN_FORMAT: &str = "jsonl";

/// Schema version for manifests and checkpoints.
pub const RUN_SCHEMA_VERSION: u32 = 1;

/// A committed run file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFile {
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
    pub checksum: u32,
}

impl AsRef<Path> for RunFile {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Boxed row iterator returned by a [`RunSource`].
pub type RowIter<T> = Box<dyn Iterator<Item = Result<T>>>;

/// Opens runs for reading.
///
/// The merge engine and planner read every run through this trait, so callers
/// can observe or intercept run access.
pub trait RunSource<T> {
    fn open(&self, path: &Path) -> Result<RowIter<T>>;
}

/// Reads runs as JSONL files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlRunSource;

impl<T: DeserializeOwned + 'static> RunSource<T> for JsonlRunSource {
    fn open(&self, path: &Path) -> Result<RowIter<T>> {
        Ok(Box::new(read_run::<T>(path)?))
    }
}

/// Lazy row iterator over one run file.
///
/// Blank lines are skipped. A line that does not decode yields
/// [`SpillError::Parse`] with its 1-based line number, after which the iterator
/// is exhausted.
pub struct JsonlRows<T> {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    line_number: usize,
    done: bool,
    _row: PhantomData<fn() -> T>,
}

impl<T> JsonlRows<T> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: DeserializeOwned> Iterator for JsonlRows<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    self.line_number += 1;
                    let trimmed = self.line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str(trimmed).map_err(|e| {
                        SpillError::parse(&self.path, self.line_number, e.to_string())
                    });
                    if parsed.is_err() {
                        self.done = true;
                    }
                    return Some(parsed);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(SpillError::parse(
                        &self.path,
                        self.line_number + 1,
                        e.to_string(),
                    )));
                }
            }
        }
    }
}

/// Open a run for reading. Each call starts from the first line.
pub fn read_run<T: DeserializeOwned>(path: &Path) -> Result<JsonlRows<T>> {
    let file = File::open(path).map_err(|e| SpillError::file_io(path, e))?;
    Ok(JsonlRows {
        path: path.to_path_buf(),
        reader: BufReader::new(file),
        line: String::new(),
        line_number: 0,
        done: false,
        _row: PhantomData,
    })
}

/// Write already sorted `rows` as a run file.
pub fn write_run_file<I, S>(
    ctx: &SpillContext,
    path: &Path,
    rows: I,
    options: &WriteOptions,
) -> Result<RunFile>
where
    I: IntoIterator<Item = S>,
    S: Serialize,
{
    let outcome = write_jsonl_atomic(ctx, path, rows, options)?;
    Ok(RunFile {
        path: path.to_path_buf(),
        rows: outcome.rows,
        bytes: outcome.bytes_written,
        checksum: outcome.checksum,
    })
}

/// Provenance sidecar for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub version: u32,
    pub format: String,
    pub compare_id: Option<String>,
    pub rows: Option<u64>,
    pub bytes: Option<u64>,
    /// File name of the run, without its directory.
    pub path: Option<String>,
    pub sources: Option<Vec<String>>,
    pub created_at: String,
}

impl RunManifest {
    pub fn new(run_path: &Path, rows: u64, bytes: u64) -> Self {
        RunManifest {
            version: RUN_SCHEMA_VERSION,
            format: RUN_FORMAT.to_string(),
            compare_id: None,
            rows: Some(rows),
            bytes: Some(bytes),
            path: run_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            sources: None,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn with_compare_id(mut self, compare_id: Option<&str>) -> Self {
        self.compare_id = compare_id.map(str::to_string);
        self
    }

    pub fn with_sources<P: AsRef<Path>>(mut self, sources: &[P]) -> Self {
        self.sources = Some(
            sources
                .iter()
                .map(|p| p.as_ref().to_string_lossy().into_owned())
                .collect(),
        );
        self
    }
}

/// `<run>.meta.json`
pub fn manifest_path_for(run_path: &Path) -> PathBuf {
    let mut name = run_path.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

pub fn write_manifest(
    ctx: &SpillContext,
    manifest_path: &Path,
    manifest: &RunManifest,
    options: &WriteOptions,
) -> Result<()> {
    write_json_file_atomic(ctx, manifest_path, manifest, &options.replace)?;
    Ok(())
}

pub fn read_manifest(manifest_path: &Path) -> Result<RunManifest> {
    let raw = std::fs::read_to_string(manifest_path)
        .map_err(|e| SpillError::file_io(manifest_path, e))?;
    Ok(serde_json::from_str(&raw)?)
}
