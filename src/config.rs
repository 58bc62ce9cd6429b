//! Configuration for postings builds.
//!
//! [`PostingsConfig`] is loaded from JSON. Missing fields take their defaults,
//! so `{}` is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::BuildOptions;
use crate::collector::{DEFAULT_SPILL_BUFFER_BYTES, DEFAULT_SPILL_BUFFER_ROWS};
use crate::cooperative::CooperativeYield;
use crate::error::{Result, SpillError};
use crate::merge::planner::DEFAULT_MAX_OPEN_RUNS;
use crate::storage::atomic::ReplaceOptions;
use crate::storage::writer::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_BUFFER_ROWS, WriteOptions};

/// Spill, merge and commit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingsConfig {
    /// Open-run budget for merges.
    pub max_open_runs: usize,

    /// Writer flush cadence in lines.
    pub max_buffer_rows: usize,

    /// Writer flush cadence in bytes.
    pub max_buffer_bytes: usize,

    /// Rows per spill run.
    pub spill_buffer_rows: usize,

    /// Bytes per spill run.
    pub spill_buffer_bytes: usize,

    pub phrase_spill_max_unique: Option<usize>,
    pub phrase_spill_max_bytes: Option<usize>,
    pub chargram_spill_max_unique: Option<usize>,
    pub chargram_spill_max_bytes: Option<usize>,

    /// Drop chargrams present in more documents than this.
    pub chargram_max_df: Option<usize>,

    /// Yield every this many rows. Zero disables yielding.
    pub cooperative_yield_every: u64,

    pub cooperative_yield_min_interval_ms: u64,

    /// Check comparator antisymmetry on every comparison.
    pub validate_comparator: bool,

    pub replace: ReplaceOptions,
}

impl Default for PostingsConfig {
    fn default() -> Self {
        PostingsConfig {
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
            max_buffer_rows: DEFAULT_MAX_BUFFER_ROWS,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            spill_buffer_rows: DEFAULT_SPILL_BUFFER_ROWS,
            spill_buffer_bytes: DEFAULT_SPILL_BUFFER_BYTES,
            phrase_spill_max_unique: None,
            phrase_spill_max_bytes: None,
            chargram_spill_max_unique: None,
            chargram_spill_max_bytes: None,
            chargram_max_df: None,
            cooperative_yield_every: 256,
            cooperative_yield_min_interval_ms: 8,
            validate_comparator: false,
            replace: ReplaceOptions::default(),
        }
    }
}

impl PostingsConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: PostingsConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SpillError::file_io(path, e))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_runs < 2 {
            return Err(SpillError::invalid_argument(format!(
                "max_open_runs must be at least 2, got {}",
                self.max_open_runs
            )));
        }
        if self.max_buffer_rows == 0 || self.spill_buffer_rows == 0 {
            return Err(SpillError::invalid_argument("buffer row limits must be positive"));
        }
        Ok(())
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            max_buffer_rows: self.max_buffer_rows,
            max_buffer_bytes: self.max_buffer_bytes,
            replace: self.replace.clone(),
        }
    }

    fn build_options(&self, label: &str, spill_dir: Option<&Path>) -> BuildOptions {
        BuildOptions {
            spill_dir: spill_dir.map(Path::to_path_buf),
            max_open_runs: self.max_open_runs,
            spill_buffer_rows: self.spill_buffer_rows,
            spill_buffer_bytes: self.spill_buffer_bytes,
            validate_comparator: self.validate_comparator,
            write: self.write_options(),
            ..BuildOptions::new(label)
        }
    }

    /// Options for the phrase n-gram build.
    pub fn phrase_options(&self, spill_dir: Option<&Path>) -> BuildOptions {
        BuildOptions {
            spill_max_unique: self.phrase_spill_max_unique,
            spill_max_bytes: self.phrase_spill_max_bytes,
            ..self.build_options("phrase_postings", spill_dir)
        }
    }

    /// Options for the chargram build, including the df cap.
    pub fn chargram_options(&self, spill_dir: Option<&Path>) -> BuildOptions {
        BuildOptions {
            spill_max_unique: self.chargram_spill_max_unique,
            spill_max_bytes: self.chargram_spill_max_bytes,
            max_df: self.chargram_max_df,
            ..self.build_options("chargram_postings", spill_dir)
        }
    }

    pub fn yielder(&self) -> CooperativeYield {
        CooperativeYield::new(
            self.cooperative_yield_every,
            Duration::from_millis(self.cooperative_yield_min_interval_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_object_is_default() {
        let config = PostingsConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PostingsConfig::default());
        assert_eq!(config.max_open_runs, 64);
        assert_eq!(config.max_buffer_rows, 5000);
        assert_eq!(config.spill_buffer_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_config() {
        let config = PostingsConfig::from_json_str(
            r#"{"max_open_runs": 8, "chargram_max_df": 100, "replace": {"keep_backup": true}}"#,
        )
        .unwrap();
        assert_eq!(config.max_open_runs, 8);
        assert!(config.replace.keep_backup);
        assert_eq!(config.replace.rename_attempts, 10);

        let chargram = config.chargram_options(Some(Path::new("/tmp/build")));
        assert_eq!(chargram.label, "chargram_postings");
        assert_eq!(chargram.max_df, Some(100));
        assert_eq!(chargram.max_open_runs, 8);

        let phrase = config.phrase_options(None);
        assert_eq!(phrase.label, "phrase_postings");
        assert!(phrase.spill_dir.is_none());
        assert!(phrase.max_df.is_none());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            PostingsConfig::from_json_str(r#"{"max_open_runs": 1}"#),
            Err(SpillError::InvalidArgument(_))
        ));
        assert!(matches!(
            PostingsConfig::from_json_str(r#"{"max_open_runs": "many"}"#),
            Err(SpillError::Json(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postings.json");
        std::fs::write(&path, r#"{"cooperative_yield_every": 0}"#).unwrap();
        let config = PostingsConfig::load(&path).unwrap();
        assert_eq!(config.cooperative_yield_every, 0);

        let missing = PostingsConfig::load(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(SpillError::FileIo { .. })));
    }
}
