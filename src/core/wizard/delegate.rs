//! Collaborators that specialize the wizard: load/save delegates and observers.

use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;

use crate::core::image::{ImageFormat, IntensityImage, LoadedImage};
use crate::error::ImageIoError;
use crate::events::{EventKind, SourceId};

/// Receives consolidated notifications from the wizard model.
///
/// The model only holds observers weakly; dropping the last `Arc`
/// unregisters the observer.
pub trait Observer {
    fn notify(&self, kind: EventKind, source: Option<SourceId>);
}

/// Decides what a loaded image is for and whether it is acceptable.
pub trait LoadDelegate: Send {
    /// History list the loaded filename is recorded in
    fn history_name(&self) -> &str;

    /// Title shown by the wizard
    fn display_name(&self) -> &str;

    /// Whether the image is loaded on top of a main image
    fn is_overlay(&self) -> bool {
        false
    }

    /// Whether the overlay should be registered to the main image
    fn use_registration(&self) -> bool {
        false
    }

    /// The main image an overlay is registered against
    fn reference_image(&self) -> Option<Arc<IntensityImage>> {
        None
    }

    /// Check a freshly loaded image. Soft problems go into `warnings`.
    fn validate(&self, _image: &LoadedImage, _warnings: &mut Vec<String>) -> Result<(), ImageIoError> {
        Ok(())
    }

    /// Called by `finalize` with the image the user accepted
    fn on_finalize(&mut self, _image: &LoadedImage) {}
}

/// Writes an image for the wizard in save mode.
pub trait SaveDelegate: Send {
    fn history_name(&self) -> &str;

    fn save(&mut self, path: &Path, format: ImageFormat) -> Result<(), ImageIoError>;
}

/// Saves an in-memory image with the `image` crate encoders.
pub struct DynamicImageSaver {
    image: DynamicImage,
    history_name: String,
}

impl DynamicImageSaver {
    pub fn new(image: DynamicImage, history_name: impl Into<String>) -> Self {
        Self {
            image,
            history_name: history_name.into(),
        }
    }
}

impl SaveDelegate for DynamicImageSaver {
    fn history_name(&self) -> &str {
        &self.history_name
    }

    fn save(&mut self, path: &Path, format: ImageFormat) -> Result<(), ImageIoError> {
        self.image
            .save_with_format(path, format.to_codec())
            .map_err(|e| ImageIoError::Save {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// Loads the main image. Anything the decoder accepts is fine.
pub struct MainImageLoadDelegate {
    history_name: String,
    display_name: String,
}

impl MainImageLoadDelegate {
    pub fn new() -> Self {
        Self {
            history_name: "MainImage".to_string(),
            display_name: "Main Image".to_string(),
        }
    }
}

impl Default for MainImageLoadDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadDelegate for MainImageLoadDelegate {
    fn history_name(&self) -> &str {
        &self.history_name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn validate(&self, image: &LoadedImage, warnings: &mut Vec<String>) -> Result<(), ImageIoError> {
        if image.width == 0 || image.height == 0 {
            return Err(ImageIoError::Validation {
                path: image.path.clone(),
                reason: "image has no pixels".to_string(),
            });
        }
        if image.components > 1 {
            warnings.push(format!(
                "Image has {} components and is displayed as luminance",
                image.components
            ));
        }
        Ok(())
    }
}

/// Loads overlays that are registered against a fixed main image.
pub struct OverlayLoadDelegate {
    reference: Arc<IntensityImage>,
    history_name: String,
    display_name: String,
    register: bool,
}

impl OverlayLoadDelegate {
    pub fn new(reference: Arc<IntensityImage>) -> Self {
        Self {
            reference,
            history_name: "OverlayImage".to_string(),
            display_name: "Overlay Image".to_string(),
            register: true,
        }
    }

    /// Turn registration off for this overlay
    pub fn without_registration(mut self) -> Self {
        self.register = false;
        self
    }
}

impl LoadDelegate for OverlayLoadDelegate {
    fn history_name(&self) -> &str {
        &self.history_name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn is_overlay(&self) -> bool {
        true
    }

    fn use_registration(&self) -> bool {
        self.register
    }

    fn reference_image(&self) -> Option<Arc<IntensityImage>> {
        Some(Arc::clone(&self.reference))
    }

    fn validate(&self, image: &LoadedImage, warnings: &mut Vec<String>) -> Result<(), ImageIoError> {
        if image.width < 2 || image.height < 2 {
            return Err(ImageIoError::Validation {
                path: image.path.clone(),
                reason: format!("{}x{} is too small to display", image.width, image.height),
            });
        }
        if image.width != self.reference.width() || image.height != self.reference.height() {
            warnings.push(format!(
                "Overlay is {}x{} but the main image is {}x{}",
                image.width,
                image.height,
                self.reference.width(),
                self.reference.height()
            ));
        }
        if image.components > 1 {
            warnings.push(format!(
                "Overlay has {} components; registration uses luminance",
                image.components
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loaded(width: u32, height: u32) -> LoadedImage {
        let decoded = DynamicImage::ImageLuma8(image::GrayImage::new(width, height));
        LoadedImage::from_dynamic(Path::new("/tmp/o.png"), ImageFormat::Png, &decoded)
    }

    #[test]
    fn overlay_delegate_warns_on_size_mismatch() {
        let reference = Arc::new(IntensityImage::from_fn(10, 10, |_, _| 0.0));
        let delegate = OverlayLoadDelegate::new(reference);
        let mut warnings = Vec::new();

        delegate.validate(&loaded(12, 10), &mut warnings).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("12x10"));
    }

    #[test]
    fn overlay_delegate_rejects_degenerate_image() {
        let reference = Arc::new(IntensityImage::from_fn(10, 10, |_, _| 0.0));
        let delegate = OverlayLoadDelegate::new(reference);
        let mut warnings = Vec::new();

        let result = delegate.validate(&loaded(1, 10), &mut warnings);
        assert!(matches!(result, Err(ImageIoError::Validation { .. })));
    }

    #[test]
    fn main_image_delegate_warns_on_color() {
        let delegate = MainImageLoadDelegate::new();
        let color = DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
        let image = LoadedImage::from_dynamic(Path::new("/tmp/m.png"), ImageFormat::Png, &color);
        let mut warnings = Vec::new();

        delegate.validate(&image, &mut warnings).unwrap();

        assert_eq!(warnings.len(), 1);
        assert!(!delegate.is_overlay());
        assert!(!delegate.use_registration());
        assert!(delegate.reference_image().is_none());
    }

    #[test]
    fn saver_writes_requested_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bmp");
        let mut saver = DynamicImageSaver::new(
            DynamicImage::ImageLuma8(image::GrayImage::new(3, 3)),
            "SegmentationImage",
        );

        saver.save(&path, ImageFormat::Bmp).unwrap();

        assert!(path.exists());
        assert_eq!(saver.history_name(), "SegmentationImage");
    }
}
