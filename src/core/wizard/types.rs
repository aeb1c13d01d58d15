//! Value types used by the wizard model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::image::ImageFormat;
use crate::core::registration::RegistrationConfig;

/// Whether the wizard reads or writes an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WizardMode {
    Load,
    Save,
}

/// Rows of the image summary page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SummaryItem {
    Filename,
    Dims,
    Spacing,
    Origin,
    Orientation,
    Components,
    DataType,
    FileSize,
}

impl SummaryItem {
    pub const ALL: [SummaryItem; 8] = [
        SummaryItem::Filename,
        SummaryItem::Dims,
        SummaryItem::Spacing,
        SummaryItem::Origin,
        SummaryItem::Orientation,
        SummaryItem::Components,
        SummaryItem::DataType,
        SummaryItem::FileSize,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SummaryItem::Filename => "File name",
            SummaryItem::Dims => "Dimensions",
            SummaryItem::Spacing => "Voxel spacing",
            SummaryItem::Origin => "Origin",
            SummaryItem::Orientation => "Orientation",
            SummaryItem::Components => "Components",
            SummaryItem::DataType => "Data type",
            SummaryItem::FileSize => "File size",
        }
    }
}

/// Result of guessing a file's format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatGuess {
    pub format: Option<ImageFormat>,
    pub file_exists: bool,
}

/// Hints handed to the wizard when it is set up.
///
/// This replaces any shared registry: everything the wizard should know
/// about past sessions comes in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardHints {
    /// Format used when saving and nothing else decides
    pub default_save_format: ImageFormat,
    pub suggested_filename: Option<PathBuf>,
    pub suggested_format: Option<ImageFormat>,
    /// Formats files were opened with before
    pub known_formats: HashMap<PathBuf, ImageFormat>,
    /// Registration settings the wizard starts with
    pub registration: RegistrationConfig,
    pub sticky_overlay: bool,
    pub sticky_overlay_colormap: String,
}

impl Default for WizardHints {
    fn default() -> Self {
        Self {
            default_save_format: ImageFormat::Png,
            suggested_filename: None,
            suggested_format: None,
            known_formats: HashMap::new(),
            registration: RegistrationConfig::default(),
            sticky_overlay: true,
            sticky_overlay_colormap: "Grayscale".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_are_serializable() {
        let mut hints = WizardHints::default();
        hints
            .known_formats
            .insert(PathBuf::from("/scans/t1.tif"), ImageFormat::Tiff);

        let json = serde_json::to_string(&hints).unwrap();
        let parsed: WizardHints = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hints);
    }

    #[test]
    fn every_summary_item_has_a_label() {
        for item in SummaryItem::ALL {
            assert!(!item.label().is_empty());
        }
    }
}
