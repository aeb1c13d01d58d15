//! # Wizard Module
//!
//! The model behind the image IO wizard. It walks an image through
//! format detection, loading and validation, optionally registers an
//! overlay against the main image, and reports every change to its
//! observers as a deduplicated notification.

mod delegate;
mod model;
mod types;

pub use delegate::{
    DynamicImageSaver, LoadDelegate, MainImageLoadDelegate, Observer, OverlayLoadDelegate,
    SaveDelegate,
};
pub use model::{ImageLoadWizardModel, ObserverId};
pub use types::{FormatGuess, SummaryItem, WizardHints, WizardMode};
