//! Format registry: the compiled-in table of texture formats the converter
//! understands, and the one place that maps tags to file extensions.
//!
//! Every tag owns exactly one extension and every extension names exactly one
//! tag, so `resolve_tag(resolve_extension(t)) == t` for all tags. The
//! extension doubles as the converter's `-ft` token.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// A texture/image format known to the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Bmp,
    Dds,
    /// Xbox-flavoured DDS container. Read-only: the viewer converts out of it.
    Ddx,
    Hdr,
    Jpg,
    Jpeg,
    Pfm,
    Png,
    Ppm,
    Tga,
    Tif,
    Tiff,
    Wmp,
}

/// One row of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    pub tag: FormatTag,
    /// Lower-case extension without the dot.
    pub extension: &'static str,
    /// May appear as the input of a conversion.
    pub source_eligible: bool,
    /// May be requested as the output of a conversion.
    pub target_eligible: bool,
}

/// Returned when an extension or name does not resolve to a tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown texture format '{0}'")]
pub struct UnknownFormat(pub String);

impl FormatTag {
    /// Every tag, in registry order.
    pub const ALL: [FormatTag; 13] = [
        FormatTag::Bmp,
        FormatTag::Dds,
        FormatTag::Ddx,
        FormatTag::Hdr,
        FormatTag::Jpg,
        FormatTag::Jpeg,
        FormatTag::Pfm,
        FormatTag::Png,
        FormatTag::Ppm,
        FormatTag::Tga,
        FormatTag::Tif,
        FormatTag::Tiff,
        FormatTag::Wmp,
    ];

    /// Canonical lower-case extension, no leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bmp => "bmp",
            Self::Dds => "dds",
            Self::Ddx => "ddx",
            Self::Hdr => "hdr",
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Pfm => "pfm",
            Self::Png => "png",
            Self::Ppm => "ppm",
            Self::Tga => "tga",
            Self::Tif => "tif",
            Self::Tiff => "tiff",
            Self::Wmp => "wmp",
        }
    }

    /// The value passed to the converter's `-ft` flag.
    pub fn token(self) -> &'static str {
        self.extension()
    }

    pub fn descriptor(self) -> FormatDescriptor {
        FormatDescriptor {
            tag: self,
            extension: self.extension(),
            source_eligible: true,
            target_eligible: !matches!(self, Self::Ddx),
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extension().to_ascii_uppercase())
    }
}

impl FromStr for FormatTag {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve_tag(s)
    }
}

/// The full registry table.
pub fn descriptors() -> impl Iterator<Item = FormatDescriptor> {
    FormatTag::ALL.into_iter().map(FormatTag::descriptor)
}

/// Whether `tag` may be requested as a conversion target.
pub fn is_supported(tag: FormatTag) -> bool {
    tag.descriptor().target_eligible
}

pub fn resolve_extension(tag: FormatTag) -> &'static str {
    tag.extension()
}

/// Look up a tag by extension. Case-insensitive; a leading dot is ignored.
pub fn resolve_tag(extension: &str) -> Result<FormatTag, UnknownFormat> {
    let wanted = extension.trim();
    let wanted = wanted.strip_prefix('.').unwrap_or(wanted);
    FormatTag::ALL
        .into_iter()
        .find(|t| t.extension().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| UnknownFormat(extension.to_string()))
}

/// The source-eligible format of `path`, judged by its extension.
pub fn source_format(path: &Path) -> Option<FormatTag> {
    let ext = path.extension()?.to_str()?;
    resolve_tag(ext)
        .ok()
        .filter(|t| t.descriptor().source_eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tags_and_extensions_are_a_bijection() {
        let mut seen = HashSet::new();
        for tag in FormatTag::ALL {
            assert!(seen.insert(tag.extension()), "duplicate extension for {tag}");
            assert_eq!(resolve_tag(resolve_extension(tag)), Ok(tag));
        }
        assert_eq!(seen.len(), FormatTag::ALL.len());
    }

    #[test]
    fn resolve_tag_ignores_case_and_dot() {
        assert_eq!(resolve_tag("PNG"), Ok(FormatTag::Png));
        assert_eq!(resolve_tag(".ddx"), Ok(FormatTag::Ddx));
        assert_eq!(resolve_tag(".TiFf"), Ok(FormatTag::Tiff));
        assert_eq!(
            resolve_tag("xyz"),
            Err(UnknownFormat("xyz".to_string()))
        );
        assert!(resolve_tag("").is_err());
    }

    #[test]
    fn ddx_is_source_only() {
        assert!(!is_supported(FormatTag::Ddx));
        assert!(FormatTag::Ddx.descriptor().source_eligible);
        let targets = descriptors().filter(|d| d.target_eligible).count();
        assert_eq!(targets, FormatTag::ALL.len() - 1);
    }

    #[test]
    fn source_format_from_path() {
        assert_eq!(source_format(Path::new("/tmp/photo.ddx")), Some(FormatTag::Ddx));
        assert_eq!(source_format(Path::new("Photo.PNG")), Some(FormatTag::Png));
        assert_eq!(source_format(Path::new("photo.xyz")), None);
        assert_eq!(source_format(Path::new("photo")), None);
    }

    #[test]
    fn display_and_token() {
        assert_eq!(FormatTag::Png.to_string(), "PNG");
        assert_eq!(FormatTag::Jpeg.token(), "jpeg");
        assert_eq!("tga".parse::<FormatTag>(), Ok(FormatTag::Tga));
    }
}
