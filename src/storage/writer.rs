//! Buffered JSONL writer that commits atomically on close.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::{Result, SpillError};
use crate::storage::atomic::{ReplaceOptions, replace_file_atomic};

/// Default number of buffered lines between flushes.
pub const DEFAULT_MAX_BUFFER_ROWS: usize = 5000;

/// Default number of buffered bytes between flushes.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Flush cadence and commit behaviour for JSONL output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Flush after this many pending lines.
    pub max_buffer_rows: usize,

    /// Flush after this many pending bytes.
    pub max_buffer_bytes: usize,

    /// Options for the final rename.
    pub replace: ReplaceOptions,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            max_buffer_rows: DEFAULT_MAX_BUFFER_ROWS,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            replace: ReplaceOptions::default(),
        }
    }
}

/// Result of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub rows: u64,
    pub bytes_written: u64,
    /// CRC32 of every byte written.
    pub checksum: u32,
}

/// Writes one JSON value per line to a temp file and renames it into place on
/// [`commit`](Self::commit).
///
/// Dropping the writer without committing removes the temp file and leaves the
/// final path untouched.
pub struct AtomicJsonlWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    options: WriteOptions,
    hasher: crc32fast::Hasher,
    line: Vec<u8>,
    pending_rows: usize,
    pending_bytes: usize,
    rows: u64,
    bytes_written: u64,
    max_line_bytes: u64,
}

impl AtomicJsonlWriter {
    pub fn create(ctx: &SpillContext, final_path: &Path, options: &WriteOptions) -> Result<Self> {
        let temp_path = ctx.temp_paths().temp_path_for(final_path);
        let file = File::create(&temp_path).map_err(|e| SpillError::file_io(&temp_path, e))?;
        let capacity = options.max_buffer_bytes.clamp(8 * 1024, 8 * 1024 * 1024);

        Ok(AtomicJsonlWriter {
            final_path: final_path.to_path_buf(),
            temp_path,
            writer: Some(BufWriter::with_capacity(capacity, file)),
            options: options.clone(),
            hasher: crc32fast::Hasher::new(),
            line: Vec::with_capacity(256),
            pending_rows: 0,
            pending_bytes: 0,
            rows: 0,
            bytes_written: 0,
            max_line_bytes: 0,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Serialize `row` and append it as one line.
    ///
    /// Returns the line length in bytes, newline included.
    pub fn write_row<S: Serialize + ?Sized>(&mut self, row: &S) -> Result<usize> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, row)?;
        self.line.push(b'\n');

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SpillError::other("writer already closed"))?;
        writer
            .write_all(&self.line)
            .map_err(|e| SpillError::file_io(&self.temp_path, e))?;

        let len = self.line.len();
        self.hasher.update(&self.line);
        self.rows += 1;
        self.bytes_written += len as u64;
        self.max_line_bytes = self.max_line_bytes.max(len as u64);
        self.pending_rows += 1;
        self.pending_bytes += len;

        if self.pending_rows >= self.options.max_buffer_rows.max(1)
            || self.pending_bytes >= self.options.max_buffer_bytes.max(1)
        {
            writer
                .flush()
                .map_err(|e| SpillError::file_io(&self.temp_path, e))?;
            self.pending_rows = 0;
            self.pending_bytes = 0;
        }
        Ok(len)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn max_line_bytes(&self) -> u64 {
        self.max_line_bytes
    }

    /// Flush, fsync and atomically move the temp file onto the final path.
    pub fn commit(mut self) -> Result<WriteOutcome> {
        let result = self.finish();
        if result.is_err() {
            self.discard_temp();
        }
        result
    }

    fn finish(&mut self) -> Result<WriteOutcome> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| SpillError::other("writer already closed"))?;
        let file = writer
            .into_inner()
            .map_err(|e| SpillError::file_io(&self.temp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| SpillError::file_io(&self.temp_path, e))?;
        drop(file);

        replace_file_atomic(&self.temp_path, &self.final_path, &self.options.replace)?;

        Ok(WriteOutcome {
            rows: self.rows,
            bytes_written: self.bytes_written,
            checksum: self.hasher.clone().finalize(),
        })
    }

    fn discard_temp(&mut self) {
        self.writer.take();
        if self.temp_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                log::debug!("could not remove {}: {e}", self.temp_path.display());
            }
        }
    }
}

impl Drop for AtomicJsonlWriter {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.discard_temp();
        }
    }
}

/// Write all `rows` to `final_path` as JSONL.
pub fn write_jsonl_atomic<I, S>(
    ctx: &SpillContext,
    final_path: &Path,
    rows: I,
    options: &WriteOptions,
) -> Result<WriteOutcome>
where
    I: IntoIterator<Item = S>,
    S: Serialize,
{
    let mut writer = AtomicJsonlWriter::create(ctx, final_path, options)?;
    for row in rows {
        writer.write_row(&row)?;
    }
    writer.commit()
}

/// Write one pretty-printed JSON document atomically.
pub fn write_json_file_atomic<S: Serialize + ?Sized>(
    ctx: &SpillContext,
    final_path: &Path,
    value: &S,
    options: &ReplaceOptions,
) -> Result<WriteOutcome> {
    let temp_path = ctx.temp_paths().temp_path_for(final_path);
    let bytes = serde_json::to_vec_pretty(value)?;

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&temp_path);
        return Err(SpillError::file_io(&temp_path, e));
    }
    if let Err(e) = replace_file_atomic(&temp_path, final_path, options) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    Ok(WriteOutcome {
        rows: 1,
        bytes_written: bytes.len() as u64,
        checksum: crc32fast::hash(&bytes),
    })
}
