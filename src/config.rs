//! Configuration for the converter, the sweeper and the viewer session.
//!
//! Everything is resolved once, at startup, into a [`ConverterConfig`] built
//! via [`ConverterConfigBuilder`], and then shared by reference (`Arc`) with
//! every component. Nothing reads environment or global state after that.

use crate::error::ConvertError;
use crate::format::FormatTag;
use crate::sweep::ArtifactPattern;
use std::path::PathBuf;
use texconv_auto::{PayloadSource, Provisioner, EXECUTABLE_NAME};

/// Environment variable overriding [`ConverterConfig::temp_root`].
pub const TEMP_DIR_ENV: &str = "AURADDX_TEMP_DIR";

/// Glob matched by checkpoint sweeps unless configured otherwise.
pub const DEFAULT_ARTIFACT_PATTERN: &str = "*.png";

/// Configuration shared by every component.
///
/// Built via [`ConverterConfig::builder()`] or using
/// [`ConverterConfig::default()`].
///
/// # Example
/// ```rust
/// use auraddx::{ConverterConfig, FormatTag};
///
/// let config = ConverterConfig::builder()
///     .temp_root("/tmp/auraddx-test")
///     .default_target(FormatTag::Tga)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Directory holding the managed executable and all generated artifacts.
    /// Default: `<system temp>/auraddx`, or `$AURADDX_TEMP_DIR`.
    pub temp_root: PathBuf,

    /// File name of the managed executable inside `temp_root`.
    pub executable_name: String,

    /// Where the converter comes from. `None` resolves at use time, see
    /// [`ConverterConfig::payload`].
    pub payload: Option<PayloadSource>,

    /// Files that checkpoint sweeps reclaim. Default: `*.<ext>` of
    /// `default_target`.
    ///
    /// Always matches what a conversion to `default_target` produces and
    /// never matches `executable_name`; [`ConverterConfigBuilder::build`]
    /// rejects a pattern that breaks either rule.
    pub artifact_pattern: ArtifactPattern,

    /// Format the viewer session converts into. Default: PNG.
    pub default_target: FormatTag,

    /// Delete an owned executable when the provisioner drops. Default: true.
    pub remove_executable_on_drop: bool,

    /// Buffered notices per subscriber on the error channel. Default: 64.
    pub channel_capacity: usize,

    /// Concurrent conversions in a batch. Default: 4.
    pub concurrency: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        let temp_root = match std::env::var(TEMP_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join("auraddx"),
        };
        Self {
            temp_root,
            executable_name: EXECUTABLE_NAME.to_string(),
            payload: None,
            artifact_pattern: ArtifactPattern::default(),
            default_target: FormatTag::Png,
            remove_executable_on_drop: true,
            channel_capacity: 64,
            concurrency: 4,
        }
    }
}

impl ConverterConfig {
    /// Create a new builder for `ConverterConfig`.
    pub fn builder() -> ConverterConfigBuilder {
        ConverterConfigBuilder {
            config: Self::default(),
            artifact_pattern: None,
        }
    }

    /// Path the managed executable is provisioned to.
    pub fn executable_path(&self) -> PathBuf {
        self.temp_root.join(&self.executable_name)
    }

    /// The effective payload.
    ///
    /// Resolution order: explicit setting, `$TEXCONV_PATH` (in place), the
    /// embedded copy when built with `bundled`, and finally an executable
    /// already sitting at [`executable_path`](Self::executable_path).
    pub fn payload(&self) -> PayloadSource {
        self.payload
            .clone()
            .or_else(PayloadSource::from_env)
            .or_else(PayloadSource::bundled)
            .unwrap_or_else(|| PayloadSource::InPlace(self.executable_path()))
    }

    /// A provisioner for this configuration. Nothing is written until
    /// [`Provisioner::ensure_ready`] is first called.
    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(self.executable_path(), self.payload())
            .remove_on_drop(self.remove_executable_on_drop)
    }
}

/// Builder for [`ConverterConfig`].
#[derive(Debug)]
pub struct ConverterConfigBuilder {
    config: ConverterConfig,
    artifact_pattern: Option<String>,
}

impl ConverterConfigBuilder {
    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_root = dir.into();
        self
    }

    pub fn executable_name(mut self, name: impl Into<String>) -> Self {
        self.config.executable_name = name.into();
        self
    }

    pub fn payload(mut self, payload: PayloadSource) -> Self {
        self.config.payload = Some(payload);
        self
    }

    /// Glob for checkpoint sweeps; validated in [`build`](Self::build).
    pub fn artifact_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.artifact_pattern = Some(pattern.into());
        self
    }

    pub fn default_target(mut self, tag: FormatTag) -> Self {
        self.config.default_target = tag;
        self
    }

    pub fn remove_executable_on_drop(mut self, v: bool) -> Self {
        self.config.remove_executable_on_drop = v;
        self
    }

    pub fn channel_capacity(mut self, n: usize) -> Self {
        self.config.channel_capacity = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<ConverterConfig, ConvertError> {
        self.config.artifact_pattern = match self.artifact_pattern.take() {
            Some(raw) => ArtifactPattern::new(&raw)?,
            None => ArtifactPattern::for_format(self.config.default_target),
        };

        let c = &self.config;
        let name = c.executable_name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ConvertError::InvalidConfig(format!(
                "Executable name must be a bare file name, got '{}'",
                c.executable_name
            )));
        }
        if c.artifact_pattern.matches_name(name) {
            return Err(ConvertError::InvalidConfig(format!(
                "Artifact pattern '{}' would sweep the managed executable '{}'",
                c.artifact_pattern, name
            )));
        }
        if !crate::format::is_supported(c.default_target) {
            return Err(ConvertError::InvalidConfig(format!(
                "{} cannot be a conversion target",
                c.default_target
            )));
        }
        let sample = format!("artifact.{}", c.default_target.extension());
        if !c.artifact_pattern.matches_name(&sample) {
            return Err(ConvertError::InvalidConfig(format!(
                "Artifact pattern '{}' would never reclaim {} artifacts such as '{}'",
                c.artifact_pattern, c.default_target, sample
            )));
        }
        Ok(self.config)
    }
}
