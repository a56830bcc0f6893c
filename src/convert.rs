//! Format conversion: one invocation of the external converter per request.
//!
//! [`FormatConverter::convert`] validates the request against the format
//! registry, makes sure the converter is provisioned, runs it with the fixed
//! argument shape
//!
//! ```text
//! <executable> <abs input> -ft <token> -y -o <abs output dir>
//! ```
//!
//! and then checks that `<output dir>/<input stem>.<extension>` really
//! exists. A converter that exits 0 without producing the file is reported
//! as a postcondition failure, never as success.
//!
//! Requests whose expected artifact paths coincide are serialised; all others
//! run as independent processes in parallel.

use crate::error::ConvertError;
use crate::events::{ErrorChannel, FailureNotice};
use crate::format::{self, FormatTag};
use crate::launcher::{ProcessLauncher, TokioLauncher};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use texconv_auto::{ProvisionedExecutable, Provisioner};
use tracing::{debug, error, info};

/// Outcome of one conversion.
pub type ConversionResult = Result<ConvertedArtifact, ConvertError>;

/// One conversion to perform. Cheap to build, discarded after the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub target: FormatTag,
}

impl ConversionRequest {
    pub fn new(source: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, target: FormatTag) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            target,
        }
    }

    /// `<output_dir>/<source stem>.<target extension>`, or `None` if the
    /// source has no file stem.
    pub fn expected_artifact(&self) -> Option<PathBuf> {
        artifact_path(&self.source, &self.output_dir, self.target)
    }
}

/// A successfully produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedArtifact {
    pub source: PathBuf,
    /// Absolute path of the produced file. Guaranteed to have existed when
    /// the call returned.
    pub path: PathBuf,
    pub format: FormatTag,
    pub duration_ms: u64,
}

/// Runs conversions through a provisioned converter.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct FormatConverter {
    provisioner: Arc<Provisioner>,
    launcher: Arc<dyn ProcessLauncher>,
    events: ErrorChannel,
    path_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FormatConverter {
    /// A converter that launches real processes.
    pub fn new(provisioner: Arc<Provisioner>, events: ErrorChannel) -> Self {
        Self::with_launcher(provisioner, events, Arc::new(TokioLauncher))
    }

    pub fn with_launcher(
        provisioner: Arc<Provisioner>,
        events: ErrorChannel,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            provisioner,
            launcher,
            events,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn events(&self) -> &ErrorChannel {
        &self.events
    }

    /// Convert `request.source` into `request.target` under `request.output_dir`.
    ///
    /// # Errors
    /// - Validation: ineligible target, unknown source extension, missing
    ///   source. No process is started.
    /// - Configuration: the converter cannot be provisioned or the output
    ///   directory cannot be created. Not retried.
    /// - Process: the converter could not start or exited nonzero; carries
    ///   its standard error verbatim.
    /// - Postcondition: exit 0 but the expected artifact is absent.
    ///
    /// Process and postcondition failures are also announced on the error
    /// channel.
    pub async fn convert(&self, request: &ConversionRequest) -> ConversionResult {
        let result = self.run(request).await;
        if let Err(ref e) = result {
            if e.kind().is_announced() {
                error!(source = %request.source.display(), error = %e, "Conversion failed");
                self.events
                    .announce(FailureNotice::from_error(&request.source, e));
            } else {
                debug!(source = %request.source.display(), error = %e, "Conversion rejected");
            }
        }
        result
    }

    /// Convert many requests, at most `concurrency` at a time.
    ///
    /// Yields `(index, result)` pairs in completion order; `index` is the
    /// position of the request in `requests`.
    pub fn convert_all(
        &self,
        requests: Vec<ConversionRequest>,
        concurrency: usize,
    ) -> impl Stream<Item = (usize, ConversionResult)> + '_ {
        stream::iter(requests.into_iter().enumerate())
            .map(move |(idx, req)| async move { (idx, self.convert(&req).await) })
            .buffer_unordered(concurrency.max(1))
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    async fn run(&self, request: &ConversionRequest) -> ConversionResult {
        let start = Instant::now();

        // ── Step 1: Validate against the registry ────────────────────────
        if !format::is_supported(request.target) {
            return Err(ConvertError::UnsupportedTarget {
                format: request.target,
            });
        }
        if format::source_format(&request.source).is_none() {
            return Err(ConvertError::UnsupportedSource {
                path: request.source.clone(),
            });
        }
        let source = std::path::absolute(&request.source).map_err(|_| {
            ConvertError::SourceNotFound {
                path: request.source.clone(),
            }
        })?;
        if !tokio::fs::metadata(&source)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Err(ConvertError::SourceNotFound { path: source });
        }

        // ── Step 2: Make sure the converter exists ───────────────────────
        let exe = self.ensure_ready().await?;

        // ── Step 3: Prepare the output directory ─────────────────────────
        let requested_dir = if request.output_dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            request.output_dir.as_path()
        };
        let output_dir = std::path::absolute(requested_dir).map_err(|e| {
            ConvertError::OutputDirectory {
                path: request.output_dir.clone(),
                source: e,
            }
        })?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| ConvertError::OutputDirectory {
                path: output_dir.clone(),
                source: e,
            })?;

        let expected = artifact_path(&source, &output_dir, request.target).ok_or_else(|| {
            ConvertError::UnsupportedSource {
                path: request.source.clone(),
            }
        })?;

        // ── Step 4: Run, one process per expected artifact at a time ─────
        let lock = self.path_lock(&lock_key(&output_dir, &expected).await);
        let _guard = lock.lock().await;

        let args = invocation_args(&source, &output_dir, request.target);
        info!(
            source = %source.display(),
            target = %request.target,
            "Converting"
        );
        let output = self
            .launcher
            .launch(&exe.path, &args)
            .await
            .map_err(|e| ConvertError::Launch {
                program: exe.path.clone(),
                source: e,
            })?;

        if !output.success {
            return Err(ConvertError::Process {
                exit_code: output.exit_code,
                diagnostic: output.stderr,
            });
        }

        // ── Step 5: Verify the artifact ──────────────────────────────────
        let produced = tokio::fs::metadata(&expected)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !produced {
            return Err(ConvertError::Postcondition { expected });
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            artifact = %expected.display(),
            duration_ms,
            "Conversion complete"
        );
        Ok(ConvertedArtifact {
            source,
            path: expected,
            format: request.target,
            duration_ms,
        })
    }

    async fn ensure_ready(&self) -> Result<ProvisionedExecutable, ConvertError> {
        if let Some(exe) = self.provisioner.get() {
            return Ok(exe.clone());
        }
        // First use writes a file; keep it off the async worker.
        let provisioner = Arc::clone(&self.provisioner);
        tokio::task::spawn_blocking(move || provisioner.ensure_ready().cloned())
            .await
            .map_err(|e| ConvertError::Internal(format!("provisioning task failed: {e}")))?
            .map_err(ConvertError::from)
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Drop entries nobody is holding or waiting on.
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

impl std::fmt::Debug for FormatConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatConverter")
            .field("provisioner", &self.provisioner)
            .field("launcher", &"<dyn ProcessLauncher>")
            .finish()
    }
}

/// The argument vector handed to the converter. Never shell-interpreted,
/// so paths need no quoting.
pub fn invocation_args(source: &Path, output_dir: &Path, target: FormatTag) -> Vec<OsString> {
    vec![
        source.as_os_str().to_os_string(),
        "-ft".into(),
        target.token().into(),
        "-y".into(),
        "-o".into(),
        output_dir.as_os_str().to_os_string(),
    ]
}

/// `expected` with its directory canonicalised, so that `..` and symlinked
/// spellings of one output directory share a lock.
async fn lock_key(output_dir: &Path, expected: &Path) -> PathBuf {
    match (tokio::fs::canonicalize(output_dir).await, expected.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => expected.to_path_buf(),
    }
}

fn artifact_path(source: &Path, output_dir: &Path, target: FormatTag) -> Option<PathBuf> {
    let mut name = source.file_stem()?.to_os_string();
    name.push(".");
    name.push(target.extension());
    Some(output_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::launcher::ProcessOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use texconv_auto::PayloadSource;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Produce,
        Fail,
        Lie,
    }

    /// Counts spawns and peak parallelism; writes the artifact itself.
    struct MockLauncher {
        behaviour: Behaviour,
        delay: Duration,
        spawns: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockLauncher {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                delay: Duration::from_millis(20),
                spawns: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProcessLauncher for MockLauncher {
        async fn launch(&self, _program: &Path, args: &[OsString]) -> std::io::Result<ProcessOutput> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let source = Path::new(&args[0]);
            let token = args[2].to_string_lossy().into_owned();
            let out_dir = Path::new(&args[5]);
            match self.behaviour {
                Behaviour::Produce => {
                    let stem = source.file_stem().unwrap().to_string_lossy();
                    std::fs::write(out_dir.join(format!("{stem}.{token}")), b"pixels")?;
                    Ok(ProcessOutput { exit_code: Some(0), success: true, stderr: String::new() })
                }
                Behaviour::Fail => Ok(ProcessOutput {
                    exit_code: Some(1),
                    success: false,
                    stderr: "bad header\n".into(),
                }),
                Behaviour::Lie => Ok(ProcessOutput { exit_code: Some(0), success: true, stderr: String::new() }),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        launcher: Arc<MockLauncher>,
        converter: FormatConverter,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(Provisioner::new(
            dir.path().join("bin").join(texconv_auto::EXECUTABLE_NAME),
            PayloadSource::Embedded(b"stub"),
        ));
        let launcher = MockLauncher::new(behaviour);
        let converter = FormatConverter::with_launcher(
            provisioner,
            ErrorChannel::new(8),
            launcher.clone(),
        );
        Fixture { dir, launcher, converter }
    }

    fn source(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, b"DDX").unwrap();
        p
    }

    #[test]
    fn argument_shape() {
        let args = invocation_args(Path::new("/in/photo.ddx"), Path::new("/out dir"), FormatTag::Png);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["/in/photo.ddx", "-ft", "png", "-y", "-o", "/out dir"]);
    }

    #[test]
    fn expected_artifact_is_deterministic() {
        let req = ConversionRequest::new("/in/photo.ddx", "/tmp", FormatTag::Png);
        assert_eq!(req.expected_artifact(), Some(PathBuf::from("/tmp/photo.png")));
        let req = ConversionRequest::new("/in/archive.tar.dds", "/tmp", FormatTag::Tga);
        assert_eq!(req.expected_artifact(), Some(PathBuf::from("/tmp/archive.tar.tga")));
    }

    #[tokio::test]
    async fn success_returns_existing_artifact() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.ddx");
        let out = f.dir.path().join("out");

        let art = f
            .converter
            .convert(&ConversionRequest::new(&src, &out, FormatTag::Png))
            .await
            .unwrap();
        assert_eq!(art.path, out.join("photo.png"));
        assert!(art.path.is_file());
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 1);
        assert!(f.converter.provisioner().is_provisioned());
    }

    #[tokio::test]
    async fn ineligible_target_spawns_nothing() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.ddx");

        let err = f
            .converter
            .convert(&ConversionRequest::new(&src, f.dir.path(), FormatTag::Ddx))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 0);
        assert!(!f.converter.provisioner().is_provisioned());
    }

    #[tokio::test]
    async fn unknown_source_extension_spawns_nothing() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.xyz");

        let err = f
            .converter
            .convert(&ConversionRequest::new(&src, f.dir.path(), FormatTag::Png))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedSource { .. }), "got: {err}");
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_source_spawns_nothing() {
        let f = fixture(Behaviour::Produce);
        let err = f
            .converter
            .convert(&ConversionRequest::new(
                f.dir.path().join("absent.ddx"),
                f.dir.path(),
                FormatTag::Png,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::SourceNotFound { .. }));
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_process_error_and_announced() {
        let f = fixture(Behaviour::Fail);
        let mut rx = f.converter.events().subscribe();
        let src = source(f.dir.path(), "photo.ddx");

        let err = f
            .converter
            .convert(&ConversionRequest::new(&src, f.dir.path(), FormatTag::Png))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert!(err.diagnostic().unwrap().contains("bad header"));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, ErrorKind::Process);
        assert!(notice.message.contains("bad header"));
    }

    #[tokio::test]
    async fn exit_zero_without_output_is_postcondition_error() {
        let f = fixture(Behaviour::Lie);
        let mut rx = f.converter.events().subscribe();
        let src = source(f.dir.path(), "photo.ddx");

        let err = f
            .converter
            .convert(&ConversionRequest::new(&src, f.dir.path(), FormatTag::Png))
            .await
            .unwrap_err();
        match err {
            ConvertError::Postcondition { expected } => {
                assert_eq!(expected.file_name().unwrap(), "photo.png")
            }
            other => panic!("expected postcondition error, got {other}"),
        }
        assert_eq!(rx.recv().await.unwrap().kind, ErrorKind::Postcondition);
    }

    #[tokio::test]
    async fn provisioning_failure_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new(Behaviour::Produce);
        let converter = FormatConverter::with_launcher(
            Arc::new(Provisioner::new(
                "unused",
                PayloadSource::InPlace(dir.path().join("missing-texconv")),
            )),
            ErrorChannel::default(),
            launcher.clone(),
        );
        let src = source(dir.path(), "photo.ddx");

        let err = converter
            .convert(&ConversionRequest::new(&src, dir.path(), FormatTag::Png))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.exit_code(), crate::error::EXIT_MISSING_DEPENDENCY);
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_output_path_is_serialised() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.ddx");
        let req = ConversionRequest::new(&src, f.dir.path().join("out"), FormatTag::Png);

        let (a, b, c) = tokio::join!(
            f.converter.convert(&req),
            f.converter.convert(&req),
            f.converter.convert(&req)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 3);
        assert_eq!(f.launcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn aliased_output_dirs_share_one_lock() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.ddx");
        let out = f.dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let plain = ConversionRequest::new(&src, &out, FormatTag::Png);
        let dotted = ConversionRequest::new(&src, out.join("..").join("out"), FormatTag::Png);

        let (a, b) = tokio::join!(f.converter.convert(&plain), f.converter.convert(&dotted));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(f.launcher.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(f.launcher.peak.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_output_dir_shares_one_lock() {
        let f = fixture(Behaviour::Produce);
        let src = source(f.dir.path(), "photo.ddx");
        let out = f.dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let link = f.dir.path().join("link");
        std::os::unix::fs::symlink(&out, &link).unwrap();

        let req_a = ConversionRequest::new(&src, &out, FormatTag::Png);
        let req_b = ConversionRequest::new(&src, &link, FormatTag::Png);
        let (a, b) = tokio::join!(
            f.converter.convert(&req_a),
            f.converter.convert(&req_b)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(f.launcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_output_dir_means_current_directory() {
        // A lying converter writes nothing, so the working directory stays clean.
        let f = fixture(Behaviour::Lie);
        let src = source(f.dir.path(), "photo.ddx");

        let err = f
            .converter
            .convert(&ConversionRequest::new(&src, "", FormatTag::Png))
            .await
            .unwrap_err();
        match err {
            ConvertError::Postcondition { expected } => {
                assert_eq!(expected, std::env::current_dir().unwrap().join("photo.png"))
            }
            other => panic!("expected postcondition error, got {other}"),
        }
    }

    #[tokio::test]
    async fn distinct_output_paths_run_in_parallel() {
        let f = fixture(Behaviour::Produce);
        let out = f.dir.path().join("out");
        let requests: Vec<_> = ["a.ddx", "b.ddx", "c.ddx", "d.ddx"]
            .iter()
            .map(|n| ConversionRequest::new(source(f.dir.path(), n), &out, FormatTag::Png))
            .collect();

        let results: Vec<_> = f.converter.convert_all(requests, 4).collect().await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(f.launcher.peak.load(Ordering::SeqCst) > 1);
        assert_eq!(f.converter.provisioner().write_count(), 1);
    }
}
