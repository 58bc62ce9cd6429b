//! K-way merge of sorted runs.

use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::SpillContext;
use crate::error::{Result, SpillError};
use crate::merge::heap::MinHeap;
use crate::postings::PostingRow;
use crate::run::{JsonlRunSource, RowIter, RunSource};
use crate::storage::writer::{AtomicJsonlWriter, WriteOptions};

type CompareFn<T> = dyn Fn(&T, &T) -> Ordering + Send + Sync;

/// Row ordering used by collectors and merges.
///
/// A validated comparator evaluates both `compare(a, b)` and `compare(b, a)` on
/// every call and fails with [`SpillError::ComparatorInvariant`] when the two
/// answers are not mirror images. Only antisymmetry is checked.
pub struct RowComparator<T> {
    compare: Arc<CompareFn<T>>,
    id: Option<String>,
    validate: bool,
}

impl<T> Clone for RowComparator<T> {
    fn clone(&self) -> Self {
        RowComparator {
            compare: Arc::clone(&self.compare),
            id: self.id.clone(),
            validate: self.validate,
        }
    }
}

impl<T> fmt::Debug for RowComparator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowComparator")
            .field("id", &self.id)
            .field("validate", &self.validate)
            .finish()
    }
}

impl<T> RowComparator<T> {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        RowComparator {
            compare: Arc::new(compare),
            id: None,
            validate: false,
        }
    }

    /// Name recorded in run manifests as `compareId`.
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Enable or disable the antisymmetry check.
    pub fn validated(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_validated(&self) -> bool {
        self.validate
    }

    pub fn compare(&self, a: &T, b: &T) -> Result<Ordering> {
        let result = (self.compare)(a, b);
        if !self.validate {
            return Ok(result);
        }
        let reverse = (self.compare)(b, a);
        if result != reverse.reverse() {
            return Err(SpillError::comparator(format!(
                "compare(a, b) = {result:?} but compare(b, a) = {reverse:?}"
            )));
        }
        Ok(result)
    }

    /// Stable sort of `rows`, stopping at the first comparator error.
    pub fn sort(&self, rows: &mut [T]) -> Result<()> {
        let mut failure = None;
        rows.sort_by(|a, b| {
            if failure.is_some() {
                return Ordering::Equal;
            }
            match self.compare(a, b) {
                Ok(ordering) => ordering,
                Err(e) => {
                    failure = Some(e);
                    Ordering::Equal
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl RowComparator<PostingRow> {
    /// Byte-wise ordering on [`PostingRow::key`].
    pub fn by_key() -> Self {
        RowComparator::new(|a: &PostingRow, b: &PostingRow| a.key.cmp(&b.key)).with_id("key")
    }
}

/// Per-run merge state.
struct MergeCursor<T> {
    rows: RowIter<T>,
    current: T,
    order: usize,
}

type CursorCompare<T> = Box<dyn FnMut(&MergeCursor<T>, &MergeCursor<T>) -> Result<Ordering>>;

/// Lazy merged sequence produced by [`merge_sorted_runs`].
///
/// Yields rows in comparator order. Ties resolve by run declaration order and
/// then by position within the run. Duplicates are preserved. After the first
/// error the iterator is exhausted.
pub struct MergedRows<T> {
    heap: MinHeap<MergeCursor<T>, CursorCompare<T>>,
    pending_error: Option<SpillError>,
    failed: bool,
}

impl<T: 'static> MergedRows<T> {
    fn advance(&mut self) -> Result<Option<T>> {
        let Some(mut cursor) = self.heap.pop()? else {
            return Ok(None);
        };
        match cursor.rows.next() {
            Some(Ok(next)) => {
                let row = mem::replace(&mut cursor.current, next);
                self.heap.push(cursor)?;
                Ok(Some(row))
            }
            Some(Err(e)) => {
                self.pending_error = Some(e);
                Ok(Some(cursor.current))
            }
            None => Ok(Some(cursor.current)),
        }
    }

    /// Number of runs that still have rows.
    pub fn open_runs(&self) -> usize {
        self.heap.len()
    }
}

impl<T: 'static> Iterator for MergedRows<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        match self.advance() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Merge sorted JSONL runs.
pub fn merge_sorted_runs<T, P>(runs: &[P], comparator: &RowComparator<T>) -> Result<MergedRows<T>>
where
    T: DeserializeOwned + 'static,
    P: AsRef<Path>,
{
    merge_sorted_runs_with(&JsonlRunSource, runs, comparator)
}

/// Merge sorted runs opened through `source`.
pub fn merge_sorted_runs_with<T, P>(
    source: &dyn RunSource<T>,
    runs: &[P],
    comparator: &RowComparator<T>,
) -> Result<MergedRows<T>>
where
    T: 'static,
    P: AsRef<Path>,
{
    let cmp = comparator.clone();
    let compare: CursorCompare<T> = Box::new(move |a: &MergeCursor<T>, b: &MergeCursor<T>| {
        Ok(cmp.compare(&a.current, &b.current)?.then(a.order.cmp(&b.order)))
    });
    let mut heap = MinHeap::with_capacity(runs.len(), compare);

    for (order, run) in runs.iter().enumerate() {
        let mut rows = source.open(run.as_ref())?;
        match rows.next() {
            Some(Ok(current)) => heap.push(MergeCursor {
                rows,
                current,
                order,
            })?,
            Some(Err(e)) => return Err(e),
            None => {}
        }
    }

    Ok(MergedRows {
        heap,
        pending_error: None,
        failed: false,
    })
}

/// Statistics for a merge written to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub rows: u64,
    pub bytes: u64,
    pub max_row_bytes: u64,
    pub checksum: u32,
    pub elapsed_ms: u64,
}

/// Merge sorted JSONL runs into `output`, committed atomically.
pub fn merge_sorted_runs_to_file<T, P>(
    ctx: &SpillContext,
    runs: &[P],
    output: &Path,
    comparator: &RowComparator<T>,
    options: &WriteOptions,
) -> Result<MergeStats>
where
    T: Serialize + DeserializeOwned + 'static,
    P: AsRef<Path>,
{
    merge_sorted_runs_to_file_with(ctx, &JsonlRunSource, runs, output, comparator, options)
}

/// [`merge_sorted_runs_to_file`] reading through `source`.
pub fn merge_sorted_runs_to_file_with<T, P>(
    ctx: &SpillContext,
    source: &dyn RunSource<T>,
    runs: &[P],
    output: &Path,
    comparator: &RowComparator<T>,
    options: &WriteOptions,
) -> Result<MergeStats>
where
    T: Serialize + 'static,
    P: AsRef<Path>,
{
    let started = Instant::now();
    let merged = merge_sorted_runs_with(source, runs, comparator)?;
    let mut writer = AtomicJsonlWriter::create(ctx, output, options)?;
    for row in merged {
        writer.write_row(&row?)?;
    }
    let max_row_bytes = writer.max_line_bytes();
    let outcome = writer.commit()?;

    log::debug!(
        "merged {} runs into {} ({} rows, {} bytes)",
        runs.len(),
        output.display(),
        outcome.rows,
        outcome.bytes_written
    );

    Ok(MergeStats {
        rows: outcome.rows,
        bytes: outcome.bytes_written,
        max_row_bytes,
        checksum: outcome.checksum,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
