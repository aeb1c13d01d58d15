//! # Core Module
//!
//! The UI-agnostic engine behind the image IO wizard.
//!
//! ## Modules
//! - `image` - Format detection, decoding and intensity buffers
//! - `registration` - Background overlay registration and its progress channel
//! - `wizard` - The load/save wizard model that ties them together

pub mod image;
pub mod registration;
pub mod wizard;

// Re-export commonly used types
pub use image::{ImageFormat, IntensityImage, LoadedImage};
pub use registration::{
    AffineTransform, ProgressChannel, RegistrationConfig, RegistrationReport, RegistrationWorker,
    WorkerState,
};
pub use wizard::{ImageLoadWizardModel, WizardHints};
