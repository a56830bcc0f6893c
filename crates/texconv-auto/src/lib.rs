//! # texconv-auto
//!
//! Guarantees that a texconv converter executable is present on disk and
//! runnable before anyone tries to launch it, writing it out **at most once
//! per process lifetime**.
//!
//! ## How it works
//!
//! On the first call to [`Provisioner::ensure_ready`]:
//!
//! 1. Resolves the [`PayloadSource`]: embedded bytes, a file to copy, or an
//!    existing executable used in place.
//! 2. For embedded / copied payloads, writes the bytes to a sibling
//!    `.partial` file, marks it executable and renames it onto the managed
//!    path so no caller ever sees a half-written converter.
//! 3. Records the SHA-256 of the executable and raises the provisioned flag.
//!
//! Subsequent calls return the recorded [`ProvisionedExecutable`] without
//! touching the filesystem.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use texconv_auto::{PayloadSource, Provisioner};
//!
//! let provisioner = Provisioner::new(
//!     std::env::temp_dir().join("auraddx").join("texconv.exe"),
//!     PayloadSource::File("/opt/texconv/texconv.exe".into()),
//! );
//! let exe = provisioner.ensure_ready().expect("converter unavailable");
//! println!("{} ({})", exe.path.display(), exe.sha256);
//! ```
//!
//! ## Known limitation
//!
//! The provisioned flag is not re-validated. If the executable is deleted by
//! someone else after provisioning, the next launch fails instead of the
//! provisioner noticing and extracting again.
//!
//! ## Environment variable overrides
//!
//! - `TEXCONV_PATH`: path to an existing converter; used in place, never
//!   written or deleted (see [`PayloadSource::from_env`]).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(feature = "bundled")]
mod bundled {
    include!(concat!(env!("OUT_DIR"), "/bundled.rs"));
}

// ── Public constants ─────────────────────────────────────────────────────────

/// File name of the converter on the current platform.
#[cfg(windows)]
pub const EXECUTABLE_NAME: &str = "texconv.exe";

/// File name of the converter on the current platform.
#[cfg(not(windows))]
pub const EXECUTABLE_NAME: &str = "texconv";

/// Environment variable naming an existing converter to use in place.
pub const PATH_ENV: &str = "TEXCONV_PATH";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned while provisioning the converter.
///
/// All of them are fatal for the calling process: nothing here is retried.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An in-place converter was configured but is not a file.
    #[error("Converter not found at '{path}'")]
    Missing { path: PathBuf },

    /// The payload file to copy could not be read.
    #[error("Converter payload '{path}' could not be read: {source}")]
    PayloadUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The directory that should hold the managed executable could not be created.
    #[error("Temp root '{path}' could not be created: {source}")]
    TempRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing the executable failed (disk full, permission denied, ...).
    #[error("Failed to write converter to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The executable bit could not be set.
    #[error("Failed to mark '{path}' as executable: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── Payload ──────────────────────────────────────────────────────────────────

/// Where the converter bytes come from.
#[derive(Clone)]
pub enum PayloadSource {
    /// Bytes compiled into the binary; written to the managed path.
    Embedded(&'static [u8]),
    /// A file whose contents are copied to the managed path.
    File(PathBuf),
    /// An existing executable used where it is. Never written, never deleted.
    InPlace(PathBuf),
}

impl PayloadSource {
    /// The converter embedded at compile time, when built with `bundled`.
    pub fn bundled() -> Option<Self> {
        #[cfg(feature = "bundled")]
        {
            Some(Self::Embedded(bundled::TEXCONV_BYTES))
        }
        #[cfg(not(feature = "bundled"))]
        {
            None
        }
    }

    /// An in-place converter named by `TEXCONV_PATH`, if set and non-empty.
    pub fn from_env() -> Option<Self> {
        match std::env::var(PATH_ENV) {
            Ok(p) if !p.trim().is_empty() => Some(Self::InPlace(PathBuf::from(p))),
            _ => None,
        }
    }

    /// Whether provisioning from this source writes a file the provisioner owns.
    pub fn is_owned(&self) -> bool {
        !matches!(self, Self::InPlace(_))
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedded(bytes) => write!(f, "Embedded(<{} bytes>)", bytes.len()),
            Self::File(p) => f.debug_tuple("File").field(p).finish(),
            Self::InPlace(p) => f.debug_tuple("InPlace").field(p).finish(),
        }
    }
}

// ── Provisioner ──────────────────────────────────────────────────────────────

/// A converter that is ready to be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedExecutable {
    /// Absolute location of the executable.
    pub path: PathBuf,
    /// Lower-case hex SHA-256 of the executable's contents.
    pub sha256: String,
    /// Whether the provisioner wrote this file (and may delete it at shutdown).
    pub owned: bool,
}

/// Owns the managed converter executable for one process.
///
/// Create one at startup, share it behind an `Arc`, and let it drop at
/// shutdown: an owned executable is then removed on a best-effort basis.
pub struct Provisioner {
    target: PathBuf,
    payload: PayloadSource,
    remove_on_drop: bool,
    ready: OnceCell<ProvisionedExecutable>,
    writes: AtomicUsize,
}

impl Provisioner {
    /// Create a provisioner that writes `payload` to `target` on first use.
    ///
    /// For [`PayloadSource::InPlace`] the in-place path wins and `target`
    /// is ignored.
    pub fn new(target: impl Into<PathBuf>, payload: PayloadSource) -> Self {
        let target = match &payload {
            PayloadSource::InPlace(p) => p.clone(),
            _ => target.into(),
        };
        Self {
            target,
            payload,
            remove_on_drop: true,
            ready: OnceCell::new(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Keep (`false`) or delete (`true`, default) an owned executable on drop.
    pub fn remove_on_drop(mut self, remove: bool) -> Self {
        self.remove_on_drop = remove;
        self
    }

    /// Path the converter is (or will be) launched from.
    pub fn executable_path(&self) -> &Path {
        &self.target
    }

    pub fn payload(&self) -> &PayloadSource {
        &self.payload
    }

    /// Ensure the converter is on disk, provisioning it on the first call.
    ///
    /// # Thread safety
    ///
    /// Concurrent first callers block on a single initialisation; exactly
    /// one of them performs the write. A failed attempt leaves the
    /// provisioner unprovisioned, so the next caller gets the error again
    /// rather than a stale "ready" flag.
    pub fn ensure_ready(&self) -> Result<&ProvisionedExecutable, ProvisionError> {
        self.ready.get_or_try_init(|| self.provision())
    }

    /// The provisioned executable, if [`ensure_ready`](Self::ensure_ready) has succeeded.
    pub fn get(&self) -> Option<&ProvisionedExecutable> {
        self.ready.get()
    }

    pub fn is_provisioned(&self) -> bool {
        self.ready.get().is_some()
    }

    /// Number of times the executable has been written in this process.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delete an owned executable now and forget it was provisioned.
    ///
    /// Returns `true` if a file was removed. Best-effort: failures are
    /// logged, never returned.
    pub fn teardown(&mut self) -> bool {
        let Some(exe) = self.ready.take() else {
            return false;
        };
        if !exe.owned {
            return false;
        }
        match std::fs::remove_file(&exe.path) {
            Ok(()) => {
                debug!(path = %exe.path.display(), "Removed managed converter");
                true
            }
            Err(e) => {
                warn!(path = %exe.path.display(), error = %e, "Could not remove managed converter");
                false
            }
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn provision(&self) -> Result<ProvisionedExecutable, ProvisionError> {
        match &self.payload {
            PayloadSource::InPlace(path) => {
                if !path.is_file() {
                    return Err(ProvisionError::Missing { path: path.clone() });
                }
                let sha256 = digest_file(path)
                    .map_err(|e| ProvisionError::PayloadUnreadable {
                        path: path.clone(),
                        source: e,
                    })?;
                info!(path = %path.display(), "Using converter in place");
                Ok(ProvisionedExecutable {
                    path: path.clone(),
                    sha256,
                    owned: false,
                })
            }
            PayloadSource::Embedded(bytes) => self.write_payload(bytes),
            PayloadSource::File(src) => {
                let bytes = std::fs::read(src).map_err(|e| ProvisionError::PayloadUnreadable {
                    path: src.clone(),
                    source: e,
                })?;
                self.write_payload(&bytes)
            }
        }
    }

    fn write_payload(&self, bytes: &[u8]) -> Result<ProvisionedExecutable, ProvisionError> {
        let target = &self.target;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::TempRoot {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let partial = partial_path(target);
        std::fs::write(&partial, bytes).map_err(|e| ProvisionError::Write {
            path: partial.clone(),
            source: e,
        })?;

        if let Err(e) = mark_executable(&partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(ProvisionError::Permissions {
                path: partial,
                source: e,
            });
        }

        if let Err(e) = std::fs::rename(&partial, target) {
            let _ = std::fs::remove_file(&partial);
            return Err(ProvisionError::Write {
                path: target.clone(),
                source: e,
            });
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        let sha256 = format!("{:x}", Sha256::digest(bytes));
        info!(
            path = %target.display(),
            bytes = bytes.len(),
            sha256 = %sha256,
            "Provisioned converter"
        );

        Ok(ProvisionedExecutable {
            path: target.clone(),
            sha256,
            owned: true,
        })
    }
}

impl Drop for Provisioner {
    fn drop(&mut self) {
        if self.remove_on_drop {
            self.teardown();
        }
    }
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("target", &self.target)
            .field("payload", &self.payload)
            .field("remove_on_drop", &self.remove_on_drop)
            .field("provisioned", &self.is_provisioned())
            .finish()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
