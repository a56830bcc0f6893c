//! Artifact reclamation.
//!
//! A [`Sweeper`] walks one directory, picks the files whose names match an
//! [`ArtifactPattern`], and deletes each one that nobody is reading. "Nobody
//! is reading" is decided by the in-use probe: an exclusive open (zero share
//! mode on Windows) followed by a non-blocking exclusive lock. Readers that
//! hold an [`OpenArtifact`] keep a shared lock, so the probe fails for them
//! and the file is skipped until a later sweep.
//!
//! Per-file failures never abort a sweep. They are logged and collected as
//! [`CleanupError`]s in the [`SweepReport`].
//!
//! Lifecycle is purely filesystem-driven: no registry of produced artifacts
//! is kept in memory.

use crate::config::DEFAULT_ARTIFACT_PATTERN;
use crate::error::{CleanupError, ConvertError};
use crate::format::FormatTag;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(windows)]
const ERROR_SHARING_VIOLATION: i32 = 32;
#[cfg(windows)]
const ERROR_LOCK_VIOLATION: i32 = 33;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A validated file-name glob, matched case-insensitively against the bare
/// file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPattern {
    raw: String,
    pattern: Pattern,
}

impl ArtifactPattern {
    pub fn new(raw: &str) -> Result<Self, ConvertError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.contains(['/', '\\']) {
            return Err(ConvertError::InvalidConfig(format!(
                "Artifact pattern must be a non-empty file-name glob, got '{raw}'"
            )));
        }
        let pattern = Pattern::new(raw).map_err(|e| {
            ConvertError::InvalidConfig(format!("Invalid artifact pattern '{raw}': {e}"))
        })?;
        Ok(Self {
            raw: raw.to_string(),
            pattern,
        })
    }

    /// `*.<ext>` for the artifacts a conversion to `tag` produces.
    pub fn for_format(tag: FormatTag) -> Self {
        Self::new(&format!("*.{}", tag.extension())).unwrap_or_default()
    }

    pub fn matches_name(&self, file_name: &str) -> bool {
        self.pattern.matches_with(file_name, MATCH_OPTIONS)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for ArtifactPattern {
    fn default() -> Self {
        Self {
            raw: DEFAULT_ARTIFACT_PATTERN.to_string(),
            pattern: Pattern::new(DEFAULT_ARTIFACT_PATTERN).unwrap_or_default(),
        }
    }
}

impl fmt::Display for ArtifactPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    /// Matched but held open by a reader; left for a later sweep.
    pub in_use: Vec<PathBuf>,
    pub failed: Vec<CleanupError>,
}

impl SweepReport {
    /// No file was skipped and none failed.
    pub fn is_clean(&self) -> bool {
        self.in_use.is_empty() && self.failed.is_empty()
    }
}

/// Reclaims matching files in a directory.
#[derive(Debug, Clone, Default)]
pub struct Sweeper {
    protected: Vec<PathBuf>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never delete `path`, even if its name matches.
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.push(path.into());
        self
    }

    /// One sweep, off the async runtime.
    pub async fn sweep(&self, dir: &Path, pattern: &ArtifactPattern) -> SweepReport {
        let sweeper = self.clone();
        let dir_owned = dir.to_path_buf();
        let pattern = pattern.clone();
        match tokio::task::spawn_blocking(move || sweeper.sweep_blocking(&dir_owned, &pattern)).await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Sweep task failed");
                SweepReport {
                    failed: vec![CleanupError::new(dir, e)],
                    ..SweepReport::default()
                }
            }
        }
    }

    /// One sweep on the calling thread.
    pub fn sweep_blocking(&self, dir: &Path, pattern: &ArtifactPattern) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Sweep directory does not exist");
                return report;
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Sweep directory unreadable");
                report.failed.push(CleanupError::new(dir, e));
                return report;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| pattern.matches_name(name))
            })
            .map(|entry| entry.path())
            .filter(|path| !self.is_protected(path))
            .collect();
        candidates.sort();
        self.reclaim_all(candidates, &mut report);

        info!(
            dir = %dir.display(),
            pattern = %pattern,
            deleted = report.deleted.len(),
            in_use = report.in_use.len(),
            failed = report.failed.len(),
            "Sweep complete"
        );
        report
    }

    fn reclaim_all(&self, candidates: Vec<PathBuf>, report: &mut SweepReport) {
        for path in candidates {
            self.reclaim(&path, report);
        }
    }

    fn reclaim(&self, path: &Path, report: &mut SweepReport) {
        match probe(path) {
            Ok(Probe::Free) => match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted artifact");
                    report.deleted.push(path.to_path_buf());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Artifact vanished before deletion");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not delete artifact");
                    report.failed.push(CleanupError::new(path, e));
                }
            },
            Ok(Probe::InUse) => {
                warn!(path = %path.display(), "Artifact in use, skipped");
                report.in_use.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Artifact vanished before probe");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not probe artifact");
                report.failed.push(CleanupError::new(path, e));
            }
        }
    }

    fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|p| same_file(p, path))
    }
}

enum Probe {
    Free,
    InUse,
}

/// The in-use probe. The handle is closed before returning.
fn probe(path: &Path) -> io::Result<Probe> {
    let file = match open_exclusive(path) {
        Ok(file) => file,
        Err(e) if is_sharing_violation(&e) => return Ok(Probe::InUse),
        Err(e) => return Err(e),
    };
    match file.try_lock() {
        Ok(()) => Ok(Probe::Free),
        Err(TryLockError::WouldBlock) => Ok(Probe::InUse),
        Err(TryLockError::Error(e)) if is_sharing_violation(&e) => Ok(Probe::InUse),
        Err(TryLockError::Error(e)) => Err(e),
    }
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new().read(true).share_mode(0).open(path)
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

#[cfg(windows)]
fn is_sharing_violation(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION)
    )
}

#[cfg(not(windows))]
fn is_sharing_violation(_e: &io::Error) -> bool {
    false
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// A produced picture held open for display.
///
/// Holds a shared lock for as long as it lives, which makes the sweeper's
/// in-use probe skip the file. Dropping the handle releases both.
#[derive(Debug)]
pub struct OpenArtifact {
    path: PathBuf,
    file: File,
}

impl OpenArtifact {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        file.lock_shared()?;
        debug!(path = %path.display(), "Holding artifact open");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}
