//! Error types for the postings spill engine.
//!
//! All fallible operations return [`SpillError`]. Structural failures (a missing
//! run, an unparsable run line, a broken comparator, an unresolved atomic commit
//! race) always surface as errors. Malformed individual posting entries never do;
//! the normalizers filter them out instead.
//!
//! # Examples
//!
//! ```
//! use postings_spill::error::{Result, SpillError};
//!
//! fn example_operation() -> Result<()> {
//!     Err(SpillError::invalid_argument("maxOpenRuns must be at least 2"))
//! }
//!
//! assert!(example_operation().is_err());
//! ```

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// The main error type for spill, merge and commit operations.
#[derive(Error, Debug)]
pub enum SpillError {
    /// I/O errors without a known path.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O errors tied to a specific file. The original `io::ErrorKind` is kept.
    #[error("I/O error at {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A run file line that could not be decoded.
    #[error("Invalid JSONL at {}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The row comparator returned inconsistent answers for a pair of rows.
    #[error("Comparator invariant violated: {0}")]
    ComparatorInvariant(String),

    /// The temp file vanished before the atomic rename and the race could not be
    /// resolved as a benign concurrent commit.
    #[error("Temp file missing before replace: {}", path.display())]
    TempFileMissing { path: PathBuf },

    /// Invalid caller-supplied argument or option.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with SpillError.
pub type Result<T> = std::result::Result<T, SpillError>;

impl SpillError {
    /// Wrap an I/O error with the path it happened on.
    pub fn file_io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        SpillError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Create a new parse error for a run file line.
    pub fn parse<P: Into<PathBuf>, S: Into<String>>(path: P, line: usize, message: S) -> Self {
        SpillError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a new comparator invariant error.
    pub fn comparator<S: Into<String>>(msg: S) -> Self {
        SpillError::ComparatorInvariant(msg.into())
    }

    /// Create a new temp-missing error.
    pub fn temp_missing(path: &Path) -> Self {
        SpillError::TempFileMissing {
            path: path.to_path_buf(),
        }
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SpillError::InvalidArgument(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        SpillError::Other(msg.into())
    }

    /// The underlying `io::ErrorKind`, if this error came from the filesystem.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SpillError::Io(e) => Some(e.kind()),
            SpillError::FileIo { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
