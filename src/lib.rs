//! # auraddx
//!
//! Convert DDX/DDS textures and friends through an external `texconv`
//! converter, and reclaim the temporary artifacts it leaves behind.
//!
//! The crate does no pixel work itself. It provisions the converter, runs it
//! with a fixed argument contract, checks that it really produced what it
//! said it did, and deletes generated files once nobody is looking at them.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Registry    validate source and target formats (no process yet)
//!  ├─ 2. Provision   write the converter once per process (texconv-auto)
//!  ├─ 3. Launch      <texconv> <input> -ft <fmt> -y -o <dir>, stderr captured
//!  ├─ 4. Verify      <dir>/<stem>.<ext> must exist, whatever the exit code said
//!  └─ 5. Report      Result to the caller, failure notice on the error channel
//!
//! sweep (at checkpoints)
//!  └─ delete matching files in the temp root unless a reader holds them open
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use auraddx::{ConversionRequest, ConverterConfig, ErrorChannel, FormatConverter, FormatTag};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConverterConfig::builder().build()?;
//!     let converter = FormatConverter::new(
//!         Arc::new(config.provisioner()),
//!         ErrorChannel::new(config.channel_capacity),
//!     );
//!     let request = ConversionRequest::new("photo.ddx", "/tmp", FormatTag::Png);
//!     let artifact = converter.convert(&request).await?;
//!     println!("{}", artifact.path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `auraddx` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `bundled` | off     | Embeds the converter at compile time from `TEXCONV_BUNDLE_BIN` |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! auraddx = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod format;
pub mod launcher;
pub mod session;
pub mod sweep;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConverterConfig, ConverterConfigBuilder};
pub use convert::{
    invocation_args, ConversionRequest, ConversionResult, ConvertedArtifact, FormatConverter,
};
pub use error::{CleanupError, ConvertError, ErrorKind};
pub use events::{ErrorChannel, FailureNotice};
pub use format::{FormatDescriptor, FormatTag, UnknownFormat};
pub use launcher::{ProcessLauncher, ProcessOutput, TokioLauncher};
pub use session::ViewerSession;
pub use sweep::{ArtifactPattern, OpenArtifact, SweepReport, Sweeper};
pub use texconv_auto::{PayloadSource, ProvisionError, ProvisionedExecutable, Provisioner};
