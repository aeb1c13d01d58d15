//! # Error Module
//!
//! Error types for the image load wizard.
//!
//! ## Design Principles
//! - **Never panic** on user data - return errors instead
//! - **Include context** - paths, operations, the state a call was rejected in
//! - **Never cross threads** - worker failures become a terminal state,
//!   not an error value thrown at the foreground

use std::path::PathBuf;
use thiserror::Error;

use crate::core::registration::{RegistrationMode, WorkerState};

/// Top-level application error
#[derive(Error, Debug)]
pub enum WizardError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Image IO error: {0}")]
    ImageIo(#[from] ImageIoError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by the registration workflow
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Cannot {operation} while registration is {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkerState,
    },

    #[error("Registration result is not ready; the run has not converged")]
    NotReady,

    #[error("Registration diverged: {0}")]
    NumericalFailure(String),

    #[error("No registration progress is available yet")]
    Unavailable,

    #[error("Image cannot be used for registration: {0}")]
    UnreadableImage(String),

    #[error("Registration mode {0} is not supported")]
    UnsupportedMode(RegistrationMode),

    #[error("Invalid registration setting {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

/// Errors from loading, saving and inspecting images
#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("Could not determine the format of {path}")]
    FormatNotDetermined { path: PathBuf },

    #[error("Format {format} cannot be handled in this wizard")]
    UnsupportedFormat { format: String },

    #[error("Failed to decode image {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Failed to save image {path}: {reason}")]
    Save { path: PathBuf, reason: String },

    #[error("Image {path} failed validation: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("No image has been loaded")]
    NoImageLoaded,

    #[error("The wizard has not been initialized for {0}")]
    NotInitialized(&'static str),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, WizardError>;
