//! # Image Load Wizard
//!
//! The model behind an image IO wizard: load or save an image, inspect it,
//! and register an overlay against a main image without blocking the
//! foreground.
//!
//! ## Architecture
//! - `core` - Image IO, registration and the wizard model (UI-agnostic)
//! - `events` - Notification kinds, the dedup bucket and the worker channel
//! - `error` - Error types for every layer
//! - `cli` - Command-line driver (binary only)

pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use error::{Result, WizardError};

/// Initialize tracing for the library
///
/// This should be called by the application entry point (CLI or GUI).
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
