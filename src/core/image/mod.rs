//! # Image Module
//!
//! Images as the wizard and the registration engine see them.
//!
//! - [`IntensityImage`] - single-channel `f32` pixels sampled by registration
//! - [`LoadedImage`] - an image read by the wizard, with its spatial metadata
//! - [`FormatDetector`] - the format identification collaborator

mod format;

pub use format::{FormatDetector, ImageFormat, MagicFormatDetector};

use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::registration::AffineTransform;
use crate::error::ImageIoError;
use crate::events::SourceId;

/// Grayscale image with `f32` intensities, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl IntensityImage {
    /// Returns `None` if `data` does not hold `width * height` pixels.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
        if data.len() != width as usize * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Build an image by evaluating `f(x, y)` at every pixel
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Convert a decoded image to luminance
    pub fn from_dynamic(image: &DynamicImage) -> Self {
        let luma = image.to_luma32f();
        let (width, height) = luma.dimensions();
        Self {
            width,
            height,
            data: luma.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixels(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Bilinear interpolation; `None` outside the pixel grid.
    pub fn sample(&self, x: f64, y: f64) -> Option<f64> {
        if self.is_empty() || !x.is_finite() || !y.is_finite() {
            return None;
        }
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
            return None;
        }

        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;

        let p00 = self.get(x0, y0)? as f64;
        let p10 = self.get(x1, y0)? as f64;
        let p01 = self.get(x0, y1)? as f64;
        let p11 = self.get(x1, y1)? as f64;

        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        Some(top + (bottom - top) * fy)
    }

    /// Geometric center in pixel coordinates
    pub fn center(&self) -> [f64; 2] {
        [
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        ]
    }

    /// Intensity-weighted centroid; the geometric center if there is no mass.
    pub fn center_of_mass(&self) -> [f64; 2] {
        let mut total = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for y in 0..self.height {
            for x in 0..self.width {
                let value = self.data[y as usize * self.width as usize + x as usize] as f64;
                if value > 0.0 {
                    total += value;
                    sum_x += value * x as f64;
                    sum_y += value * y as f64;
                }
            }
        }
        if total <= 0.0 || !total.is_finite() {
            return self.center();
        }
        [sum_x / total, sum_y / total]
    }

    /// Smallest and largest intensity, or `None` for an empty image
    pub fn range(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Whether every pixel holds a finite value and the image has at least 2x2 pixels
    pub fn is_usable(&self) -> bool {
        self.width >= 2 && self.height >= 2 && self.data.iter().all(|v| v.is_finite())
    }
}

/// An image read by the wizard, with the metadata it displays.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    id: SourceId,
    pub path: PathBuf,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub data_type: String,
    pub spacing: [f64; 2],
    pub origin: [f64; 2],
    /// Spatial transform placing this image relative to the main image
    pub transform: AffineTransform,
    pub file_size: u64,
    pixels: Arc<IntensityImage>,
}

impl LoadedImage {
    /// Decode an image file of a known format
    pub fn open(path: &Path, format: ImageFormat) -> Result<Self, ImageIoError> {
        let metadata = std::fs::metadata(path).map_err(|source| ImageIoError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = image::ImageReader::open(path).map_err(|source| ImageIoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        reader.set_format(format.to_codec());
        let decoded = reader.decode().map_err(|e| ImageIoError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut loaded = Self::from_dynamic(path, format, &decoded);
        loaded.file_size = metadata.len();
        Ok(loaded)
    }

    /// Wrap an already decoded image
    pub fn from_dynamic(path: &Path, format: ImageFormat, decoded: &DynamicImage) -> Self {
        let color = decoded.color();
        let data_type = format!("{:?}", color);
        Self {
            id: SourceId::new(),
            path: path.to_path_buf(),
            format,
            width: decoded.width(),
            height: decoded.height(),
            components: color.channel_count(),
            data_type,
            spacing: [1.0, 1.0],
            origin: [0.0, 0.0],
            transform: AffineTransform::identity(),
            file_size: 0,
            pixels: Arc::new(IntensityImage::from_dynamic(decoded)),
        }
    }

    /// Identity used when this image is the source of a notification
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Shared handle to the pixel data
    pub fn pixels(&self) -> Arc<IntensityImage> {
        Arc::clone(&self.pixels)
    }
}
