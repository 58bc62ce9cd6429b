//! Atomic replacement of a file from a temp path.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpillError};

/// Filesystem operations used by the committer.
///
/// The default [`StdFileOps`] forwards to `std::fs`. Alternative implementations
/// can simulate rename failures.
pub trait FileOps {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn metadata(&self, path: &Path) -> io::Result<Metadata>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }
}

/// [`FileOps`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(path)
    }
}

/// Options for [`replace_file_atomic`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceOptions {
    /// Keep `<final>.bak` after a successful replace.
    pub keep_backup: bool,

    /// Rename attempts for retryable errors.
    pub rename_attempts: u32,

    /// Linear backoff step between rename attempts.
    pub rename_base_delay_ms: u64,

    /// Polls for a temp file that is not visible yet.
    pub temp_wait_attempts: u32,

    /// Linear backoff step between temp polls.
    pub temp_wait_base_delay_ms: u64,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        ReplaceOptions {
            keep_backup: false,
            rename_attempts: 10,
            rename_base_delay_ms: 20,
            temp_wait_attempts: 5,
            temp_wait_base_delay_ms: 10,
        }
    }
}

/// Timestamp slack when deciding whether a final file was written by a
/// concurrent commit. Covers filesystems with coarse mtimes.
pub const FRESH_FINAL_SKEW: Duration = Duration::from_millis(2000);

/// `<final>.bak`
pub fn backup_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AlreadyExists
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::DirectoryNotEmpty
            | io::ErrorKind::CrossesDevices
            | io::ErrorKind::ResourceBusy
    )
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::path::absolute(a), std::path::absolute(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Replace `final_path` with the contents of `temp_path`.
///
/// `temp_path` must be a sibling of `final_path` with a unique suffix, see
/// [`crate::context::TempPathAllocator`].
pub fn replace_file_atomic(
    temp_path: &Path,
    final_path: &Path,
    options: &ReplaceOptions,
) -> Result<()> {
    replace_file_atomic_with(&StdFileOps, temp_path, final_path, options)
}

/// [`replace_file_atomic`] over an explicit [`FileOps`].
pub fn replace_file_atomic_with(
    fs: &dyn FileOps,
    temp_path: &Path,
    final_path: &Path,
    options: &ReplaceOptions,
) -> Result<()> {
    let started = SystemTime::now();

    if same_path(temp_path, final_path) {
        return if fs.exists(final_path) {
            Ok(())
        } else {
            Err(SpillError::temp_missing(temp_path))
        };
    }

    let final_existed = match fs.metadata(final_path) {
        Ok(meta) if meta.is_dir() => {
            return Err(SpillError::invalid_argument(format!(
                "final path is a directory: {}",
                final_path.display()
            )));
        }
        Ok(_) => true,
        Err(_) => false,
    };

    let mut commit = Commit {
        fs,
        temp: temp_path,
        target: final_path,
        backup: backup_path(final_path),
        options,
        started,
        final_existed,
        backup_created: false,
    };
    commit.run()
}

/// State for one replace operation.
struct Commit<'a> {
    fs: &'a dyn FileOps,
    temp: &'a Path,
    target: &'a Path,
    backup: PathBuf,
    options: &'a ReplaceOptions,
    started: SystemTime,
    final_existed: bool,
    backup_created: bool,
}

impl Commit<'_> {
    fn run(&mut self) -> Result<()> {
        if !self.wait_for_temp() {
            return self.resolve_missing_temp();
        }

        self.take_backup();

        match self.rename_with_retry() {
            Ok(()) => {
                self.discard_backup();
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if !self.wait_for_temp() {
                    return self.resolve_missing_temp();
                }
                match self.rename_with_retry() {
                    Ok(()) => {
                        self.discard_backup();
                        Ok(())
                    }
                    Err(retry_err) => {
                        self.restore_backup();
                        Err(SpillError::file_io(self.temp, retry_err))
                    }
                }
            }
            Err(err) if !is_retryable(&err) => {
                self.restore_backup();
                Err(SpillError::file_io(self.temp, err))
            }
            Err(err) => self.recover(err),
        }
    }

    fn wait_for_temp(&self) -> bool {
        let attempts = self.options.temp_wait_attempts.max(1);
        for attempt in 0..attempts {
            if self.fs.exists(self.temp) {
                return true;
            }
            if attempt + 1 < attempts {
                let step = self.options.temp_wait_base_delay_ms.max(1);
                thread::sleep(Duration::from_millis(step * u64::from(attempt + 1)));
            }
        }
        false
    }

    fn rename_with_retry(&self) -> io::Result<()> {
        let attempts = self.options.rename_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.fs.rename(self.temp, self.target) {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(&err) && attempt + 1 < attempts => {
                    log::debug!(
                        "rename {} -> {} failed ({}), retrying",
                        self.temp.display(),
                        self.target.display(),
                        err.kind()
                    );
                    let step = self.options.rename_base_delay_ms.max(1);
                    thread::sleep(Duration::from_millis(step * u64::from(attempt + 1)));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Move the current final file aside, unless a backup is already present.
    fn take_backup(&mut self) {
        if !self.final_existed || self.fs.exists(&self.backup) {
            return;
        }
        match self.fs.rename(self.target, &self.backup) {
            Ok(()) => self.backup_created = true,
            Err(err) => log::debug!(
                "could not move {} to backup: {err}",
                self.target.display()
            ),
        }
    }

    fn discard_backup(&mut self) {
        if self.options.keep_backup || !self.backup_created {
            return;
        }
        if let Err(err) = self.fs.remove_file(&self.backup) {
            log::debug!("could not remove {}: {err}", self.backup.display());
        }
        self.backup_created = false;
    }

    fn restore_backup(&mut self) -> bool {
        if !self.backup_created || self.fs.exists(self.target) || !self.fs.exists(&self.backup) {
            return false;
        }
        match self.fs.rename(&self.backup, self.target) {
            Ok(()) => {
                self.backup_created = false;
                true
            }
            Err(err) => {
                log::warn!(
                    "failed to restore {} from backup: {err}",
                    self.target.display()
                );
                false
            }
        }
    }

    fn final_is_fresh(&self) -> bool {
        let Ok(meta) = self.fs.metadata(self.target) else {
            return false;
        };
        if !self.final_existed {
            return true;
        }
        meta.modified()
            .is_ok_and(|mtime| mtime + FRESH_FINAL_SKEW >= self.started)
    }

    /// The temp file is gone. Succeed only if another writer already committed.
    fn resolve_missing_temp(&mut self) -> Result<()> {
        if self.final_is_fresh() {
            log::debug!(
                "temp {} missing but {} was committed concurrently",
                self.temp.display(),
                self.target.display()
            );
            self.discard_backup();
            return Ok(());
        }
        self.restore_backup();
        Err(SpillError::temp_missing(self.temp))
    }

    fn copy_fallback(&mut self, reason: &io::Error) -> bool {
        let had_target = self.fs.exists(self.target);
        match self.fs.copy(self.temp, self.target) {
            Ok(_) => {
                if let Err(err) = self.fs.remove_file(self.temp) {
                    log::debug!("could not remove {}: {err}", self.temp.display());
                }
                log::warn!(
                    "rename into {} failed ({}), committed by copy",
                    self.target.display(),
                    reason.kind()
                );
                true
            }
            Err(err) => {
                log::debug!("copy fallback for {} failed: {err}", self.target.display());
                // A partial copy is only discarded when the target held nothing
                // worth keeping or the backup can bring it back.
                if self.backup_created || !had_target {
                    if let Err(err) = self.fs.remove_file(self.target) {
                        if err.kind() != io::ErrorKind::NotFound {
                            log::debug!("could not remove {}: {err}", self.target.display());
                        }
                    }
                }
                false
            }
        }
    }

    /// Retries exhausted on a retryable error.
    ///
    /// The current final file is never overwritten unless a backup of it exists.
    fn recover(&mut self, err: io::Error) -> Result<()> {
        if !self.backup_created && self.fs.exists(self.target) {
            match self.fs.copy(self.target, &self.backup) {
                Ok(_) => self.backup_created = true,
                Err(copy_err) => {
                    log::warn!(
                        "could not back up {} before falling back: {copy_err}",
                        self.target.display()
                    );
                    return Err(SpillError::file_io(self.target, err));
                }
            }
        }

        if self.backup_created {
            if let Err(remove_err) = self.fs.remove_file(self.target) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    log::debug!("could not remove {}: {remove_err}", self.target.display());
                }
            }
            match self.fs.rename(self.temp, self.target) {
                Ok(()) => {
                    self.discard_backup();
                    return Ok(());
                }
                Err(rename_err) => log::debug!(
                    "rename {} -> {} failed again: {rename_err}",
                    self.temp.display(),
                    self.target.display()
                ),
            }
        }

        if self.copy_fallback(&err) {
            self.discard_backup();
            return Ok(());
        }
        self.restore_backup();
        Err(SpillError::file_io(self.target, err))
    }
}
