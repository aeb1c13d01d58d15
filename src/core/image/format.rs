//! File format identification.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Image file formats the wizard can load or save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Gif,
    WebP,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 6] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Tiff,
        ImageFormat::Bmp,
        ImageFormat::Gif,
        ImageFormat::WebP,
    ];

    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| {
            format
                .extensions()
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
    }

    /// Detect format from the extension of a path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Look up a format by its display name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(name))
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Tiff => "TIFF",
            ImageFormat::Bmp => "BMP",
            ImageFormat::Gif => "GIF",
            ImageFormat::WebP => "WebP",
        }
    }

    /// Recognized extensions, preferred one first
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ImageFormat::Png => &["png"],
            ImageFormat::Jpeg => &["jpg", "jpeg"],
            ImageFormat::Tiff => &["tif", "tiff"],
            ImageFormat::Bmp => &["bmp"],
            ImageFormat::Gif => &["gif"],
            ImageFormat::WebP => &["webp"],
        }
    }

    /// Whether the encoder keeps full precision
    pub fn is_lossless(&self) -> bool {
        !matches!(self, ImageFormat::Jpeg)
    }

    pub(crate) fn to_codec(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Tiff => image::ImageFormat::Tiff,
            ImageFormat::Bmp => image::ImageFormat::Bmp,
            ImageFormat::Gif => image::ImageFormat::Gif,
            ImageFormat::WebP => image::ImageFormat::WebP,
        }
    }

    pub(crate) fn from_codec(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::Tiff => Some(ImageFormat::Tiff),
            image::ImageFormat::Bmp => Some(ImageFormat::Bmp),
            image::ImageFormat::Gif => Some(ImageFormat::Gif),
            image::ImageFormat::WebP => Some(ImageFormat::WebP),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identifies the format of an image file.
///
/// Implement this trait to plug in other detection schemes (e.g., for testing).
pub trait FormatDetector: Send + Sync {
    /// Returns `None` when the format cannot be determined.
    fn detect(&self, path: &Path) -> Option<ImageFormat>;
}

/// Checks magic bytes first, then falls back to the extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicFormatDetector;

impl FormatDetector for MagicFormatDetector {
    fn detect(&self, path: &Path) -> Option<ImageFormat> {
        let sniffed = image::ImageReader::open(path)
            .ok()
            .and_then(|reader| reader.with_guessed_format().ok())
            .and_then(|reader| reader.format())
            .and_then(ImageFormat::from_codec);

        sniffed.or_else(|| ImageFormat::from_path(path))
    }
}
