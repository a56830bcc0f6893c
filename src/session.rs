//! Viewer session: the checkpoint discipline of an interactive host.
//!
//! A host that displays one picture at a time drives the core through a
//! [`ViewerSession`]:
//!
//! - [`open`](ViewerSession::open) checks the new picture, releases the
//!   one on display, sweeps the temp root (the "before a new conversion"
//!   checkpoint, which never touches the picture being opened), converts a
//!   DDX into the configured target format, and holds the result open.
//!   A PNG is displayed as is.
//! - [`close`](ViewerSession::close) releases the picture and sweeps again
//!   (the "view teardown" checkpoint).
//!
//! Sweeps never run on a timer, so a freshly produced artifact cannot be
//! reclaimed between conversion and display.

use crate::config::ConverterConfig;
use crate::convert::{ConversionRequest, FormatConverter};
use crate::error::ConvertError;
use crate::events::ErrorChannel;
use crate::format::{self, FormatTag};
use crate::sweep::{OpenArtifact, SweepReport, Sweeper};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Source formats the viewer accepts.
pub const VIEWABLE: [FormatTag; 2] = [FormatTag::Ddx, FormatTag::Png];

pub struct ViewerSession {
    config: Arc<ConverterConfig>,
    converter: Arc<FormatConverter>,
    sweeper: Sweeper,
    current: Option<OpenArtifact>,
}

impl ViewerSession {
    /// A session with its own provisioner, converter and error channel.
    pub fn new(config: Arc<ConverterConfig>) -> Self {
        let provisioner = Arc::new(config.provisioner());
        let events = ErrorChannel::new(config.channel_capacity);
        let converter = Arc::new(FormatConverter::new(provisioner, events));
        Self::with_converter(config, converter)
    }

    /// A session sharing an existing converter.
    pub fn with_converter(config: Arc<ConverterConfig>, converter: Arc<FormatConverter>) -> Self {
        let sweeper = Sweeper::new()
            .protect(config.executable_path())
            .protect(converter.provisioner().executable_path());
        Self {
            config,
            converter,
            sweeper,
            current: None,
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn converter(&self) -> &Arc<FormatConverter> {
        &self.converter
    }

    pub fn events(&self) -> &ErrorChannel {
        self.converter.events()
    }

    /// The picture currently on display.
    pub fn current(&self) -> Option<&OpenArtifact> {
        self.current.as_ref()
    }

    /// Display `path`, converting it first if it is a DDX.
    pub async fn open(&mut self, path: impl AsRef<Path>) -> Result<&OpenArtifact, ConvertError> {
        let path = path.as_ref();
        let tag = format::source_format(path)
            .filter(|t| VIEWABLE.contains(t))
            .ok_or_else(|| ConvertError::UnsupportedSource {
                path: path.to_path_buf(),
            })?;
        if !path.is_file() {
            return Err(ConvertError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }

        self.current = None;
        let sweeper = self.sweeper.clone().protect(path);
        sweeper
            .sweep(&self.config.temp_root, &self.config.artifact_pattern)
            .await;

        let display_path = if tag == FormatTag::Png {
            path.to_path_buf()
        } else {
            let request = ConversionRequest::new(
                path,
                &self.config.temp_root,
                self.config.default_target,
            );
            self.converter.convert(&request).await?.path
        };

        let artifact =
            OpenArtifact::open(&display_path).map_err(|e| ConvertError::Unreadable {
                path: display_path.clone(),
                source: e,
            })?;
        info!(source = %path.display(), shown = %display_path.display(), "Picture opened");
        Ok(&*self.current.insert(artifact))
    }

    /// Release the picture on display and reclaim artifacts.
    pub async fn close(&mut self) -> SweepReport {
        if let Some(artifact) = self.current.take() {
            info!(path = %artifact.path().display(), "Picture closed");
        }
        self.checkpoint().await
    }

    async fn checkpoint(&self) -> SweepReport {
        self.sweeper
            .sweep(&self.config.temp_root, &self.config.artifact_pattern)
            .await
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("temp_root", &self.config.temp_root)
            .field("current", &self.current.as_ref().map(OpenArtifact::path))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texconv_auto::PayloadSource;

    fn session(root: &Path) -> ViewerSession {
        let config = ConverterConfig::builder()
            .temp_root(root)
            .payload(PayloadSource::InPlace(root.join("no-converter-here")))
            .build()
            .unwrap();
        ViewerSession::new(Arc::new(config))
    }

    #[tokio::test]
    async fn png_is_shown_without_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let pictures = dir.path().join("pictures");
        std::fs::create_dir(&pictures).unwrap();
        let png = pictures.join("photo.png");
        std::fs::write(&png, b"png").unwrap();

        let mut s = session(&dir.path().join("tmp"));
        let shown = s.open(&png).await.unwrap();
        assert_eq!(shown.path(), png);
        assert!(!s.converter().provisioner().is_provisioned());
    }

    #[tokio::test]
    async fn png_inside_temp_root_survives_its_own_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        std::fs::create_dir(&root).unwrap();
        let earlier = root.join("earlier.png");
        let stale = root.join("stale.png");
        std::fs::write(&earlier, b"png").unwrap();
        std::fs::write(&stale, b"png").unwrap();

        let mut s = session(&root);
        let shown = s.open(&earlier).await.unwrap();
        assert_eq!(shown.path(), earlier);
        assert!(earlier.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn rejected_open_sweeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        std::fs::create_dir(&root).unwrap();
        let leftover = root.join("old.png");
        std::fs::write(&leftover, b"png").unwrap();

        let mut s = session(&root);
        let err = s.open(root.join("missing.png")).await.unwrap_err();
        assert!(matches!(err, ConvertError::SourceNotFound { .. }), "got: {err}");
        assert!(leftover.exists());
    }

    #[tokio::test]
    async fn other_formats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tga = dir.path().join("photo.tga");
        std::fs::write(&tga, b"tga").unwrap();

        let mut s = session(&dir.path().join("tmp"));
        let err = s.open(&tga).await.unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedSource { .. }), "got: {err}");
        assert!(s.current().is_none());
    }

    #[tokio::test]
    async fn ddx_without_converter_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let ddx = dir.path().join("photo.ddx");
        std::fs::write(&ddx, b"ddx").unwrap();

        let mut s = session(&dir.path().join("tmp"));
        let err = s.open(&ddx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn close_sweeps_released_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        std::fs::create_dir(&root).unwrap();
        let leftover = root.join("old.png");
        std::fs::write(&leftover, b"png").unwrap();

        let mut s = session(&root);
        let report = s.close().await;
        assert_eq!(report.deleted, vec![leftover.clone()]);
        assert!(!leftover.exists());
    }
}
