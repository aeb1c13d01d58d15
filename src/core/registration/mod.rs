//! # Registration Module
//!
//! Aligns an overlay image to a reference image on a background thread.
//!
//! ## Pieces
//! 1. **Config** - mode, metric and initialization, passed in at start
//! 2. **Optimizer** - one gradient-descent step per iteration
//! 3. **ProgressChannel** - latest-value-wins mailbox read by the foreground
//! 4. **RegistrationWorker** - the state machine and its thread
//!
//! ## Lifecycle
//! `Idle -> Running -> {Converged, Cancelled, Failed}`. Terminal states are
//! final; a new run needs a new worker.

mod metric;
mod optimizer;
mod progress;
mod transform;
mod worker;

pub use metric::{build_metric, SimilarityMetric};
pub use optimizer::{GradientDescentOptimizer, IterativeOptimizer, StepOutcome};
pub use progress::{ProgressChannel, ProgressReading, ProgressSample};
pub use transform::AffineTransform;
pub use worker::{CancellationToken, RegistrationReport, RegistrationWorker};

#[cfg(test)]
pub(crate) use optimizer::tests::blobs;

use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Degrees of freedom of the transform being optimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationMode {
    /// Rotation and translation
    Rigid,
    /// Full linear map plus translation
    Affine,
    /// Free-form deformation; recognized but not supported by this engine
    Deformable,
}

impl RegistrationMode {
    pub const ALL: [RegistrationMode; 3] = [
        RegistrationMode::Rigid,
        RegistrationMode::Affine,
        RegistrationMode::Deformable,
    ];

    pub fn is_supported(&self) -> bool {
        !matches!(self, RegistrationMode::Deformable)
    }
}

impl std::fmt::Display for RegistrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationMode::Rigid => write!(f, "Rigid"),
            RegistrationMode::Affine => write!(f, "Affine"),
            RegistrationMode::Deformable => write!(f, "Deformable"),
        }
    }
}

/// Image similarity measure driving the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationMetric {
    /// Works across modalities
    MutualInformation,
    /// Same modality, different contrast
    CrossCorrelation,
    /// Same modality, same contrast
    MeanSquares,
}

impl RegistrationMetric {
    pub const ALL: [RegistrationMetric; 3] = [
        RegistrationMetric::MutualInformation,
        RegistrationMetric::CrossCorrelation,
        RegistrationMetric::MeanSquares,
    ];
}

impl std::fmt::Display for RegistrationMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationMetric::MutualInformation => write!(f, "Mutual information"),
            RegistrationMetric::CrossCorrelation => write!(f, "Cross-correlation"),
            RegistrationMetric::MeanSquares => write!(f, "Mean squared difference"),
        }
    }
}

/// How the starting transform is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationInit {
    /// Start from the identity
    Identity,
    /// Align intensity centroids
    Moments,
    /// Start from `RegistrationConfig::manual_transform`
    Manual,
}

impl RegistrationInit {
    pub const ALL: [RegistrationInit; 3] = [
        RegistrationInit::Identity,
        RegistrationInit::Moments,
        RegistrationInit::Manual,
    ];
}

impl std::fmt::Display for RegistrationInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationInit::Identity => write!(f, "Identity"),
            RegistrationInit::Moments => write!(f, "Image moments"),
            RegistrationInit::Manual => write!(f, "Manual"),
        }
    }
}

/// Where a registration worker is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Running,
    Converged,
    Cancelled,
    Failed,
}

impl WorkerState {
    /// No further progress is published from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Converged | WorkerState::Cancelled | WorkerState::Failed
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Converged => write!(f, "converged"),
            WorkerState::Cancelled => write!(f, "cancelled"),
            WorkerState::Failed => write!(f, "failed"),
        }
    }
}

/// Accepted range for `RegistrationConfig::histogram_bins`
pub const HISTOGRAM_BINS: std::ops::RangeInclusive<usize> = 2..=256;

/// Everything a registration run needs besides the two images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub mode: RegistrationMode,
    pub metric: RegistrationMetric,
    pub init: RegistrationInit,
    /// Starting transform when `init` is `Manual`
    pub manual_transform: Option<AffineTransform>,
    /// Upper bound on optimizer iterations
    pub max_iterations: u64,
    /// First step length, in pixels
    pub initial_step: f64,
    /// The run converges once the step shrinks below this
    pub min_step: f64,
    /// Step shrink factor applied when the gradient reverses
    pub relaxation: f64,
    /// Evaluate the metric on every n-th pixel of the reference
    pub sampling_stride: u32,
    /// Bins per axis of the mutual information histogram
    pub histogram_bins: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            mode: RegistrationMode::Rigid,
            metric: RegistrationMetric::MutualInformation,
            init: RegistrationInit::Moments,
            manual_transform: None,
            max_iterations: 200,
            initial_step: 2.0,
            min_step: 0.01,
            relaxation: 0.5,
            sampling_stride: 1,
            histogram_bins: 32,
        }
    }
}

impl RegistrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: RegistrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn metric(mut self, metric: RegistrationMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn init(mut self, init: RegistrationInit) -> Self {
        self.init = init;
        self
    }

    /// Use `transform` as the starting point; switches `init` to `Manual`
    pub fn manual_transform(mut self, transform: AffineTransform) -> Self {
        self.init = RegistrationInit::Manual;
        self.manual_transform = Some(transform);
        self
    }

    pub fn max_iterations(mut self, iterations: u64) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn step_bounds(mut self, initial: f64, min: f64) -> Self {
        self.initial_step = initial;
        self.min_step = min;
        self
    }

    pub fn sampling_stride(mut self, stride: u32) -> Self {
        self.sampling_stride = stride;
        self
    }

    /// Check every numeric setting.
    ///
    /// Configs can arrive from hint files, so nothing here is trusted.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        let invalid = |field: &'static str, reason: String| {
            Err(RegistrationError::InvalidConfig { field, reason })
        };

        if !(self.initial_step.is_finite() && self.initial_step > 0.0) {
            return invalid(
                "initial_step",
                format!("{} is not a finite positive length", self.initial_step),
            );
        }
        if !(self.min_step.is_finite() && self.min_step >= 0.0) {
            return invalid(
                "min_step",
                format!("{} is not a finite non-negative length", self.min_step),
            );
        }
        if self.min_step > self.initial_step {
            return invalid(
                "min_step",
                format!(
                    "{} is larger than the initial step {}",
                    self.min_step, self.initial_step
                ),
            );
        }
        if !(self.relaxation > 0.0 && self.relaxation < 1.0) {
            return invalid(
                "relaxation",
                format!("{} is outside (0, 1)", self.relaxation),
            );
        }
        if self.sampling_stride == 0 {
            return invalid("sampling_stride", "must be at least 1".to_string());
        }
        if !HISTOGRAM_BINS.contains(&self.histogram_bins) {
            return invalid(
                "histogram_bins",
                format!(
                    "{} is outside {}..={}",
                    self.histogram_bins,
                    HISTOGRAM_BINS.start(),
                    HISTOGRAM_BINS.end()
                ),
            );
        }
        if self.init == RegistrationInit::Manual {
            if let Some(transform) = &self.manual_transform {
                if !transform.is_finite() {
                    return invalid("manual_transform", "holds non-finite values".to_string());
                }
            }
        }
        Ok(())
    }
}
