//! Regular-step gradient descent over rigid or affine transform parameters.
//!
//! Parameters are optimized in a scaled space where one unit of any
//! parameter moves reference pixels by roughly one pixel, so a single step
//! length serves rotations, matrix entries and translations alike.

use std::sync::Arc;

use crate::core::image::IntensityImage;
use crate::error::RegistrationError;

use super::metric::{build_metric, SimilarityMetric};
use super::{AffineTransform, RegistrationConfig, RegistrationInit, RegistrationMode};

/// Central-difference half width, in scaled parameter units
const DIFFERENCE_STEP: f64 = 0.5;

/// What one call to [`IterativeOptimizer::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One iteration completed; its value and transform are current
    Stepped,
    /// Nothing left to do; no iteration was taken
    Converged,
}

/// An optimizer the registration worker drives one iteration at a time.
pub trait IterativeOptimizer: Send {
    fn step(&mut self) -> Result<StepOutcome, RegistrationError>;

    /// Metric value at the current parameters
    fn value(&self) -> f64;

    /// Completed iterations
    fn iteration(&self) -> u64;

    fn transform(&self) -> AffineTransform;
}

pub struct GradientDescentOptimizer {
    reference: Arc<IntensityImage>,
    overlay: Arc<IntensityImage>,
    metric: Box<dyn SimilarityMetric>,
    mode: RegistrationMode,
    center: [f64; 2],
    params: Vec<f64>,
    scales: Vec<f64>,
    step_length: f64,
    min_step: f64,
    relaxation: f64,
    max_iterations: u64,
    iteration: u64,
    value: f64,
    previous_direction: Option<Vec<f64>>,
    divergence_limit: f64,
}

impl GradientDescentOptimizer {
    /// Validate the inputs, pick the starting transform and score it.
    pub fn new(
        config: &RegistrationConfig,
        reference: Arc<IntensityImage>,
        overlay: Arc<IntensityImage>,
    ) -> Result<Self, RegistrationError> {
        if !config.mode.is_supported() {
            return Err(RegistrationError::UnsupportedMode(config.mode));
        }
        config.validate()?;
        if !reference.is_usable() {
            return Err(RegistrationError::UnreadableImage(
                "reference image is empty or holds non-finite pixels".to_string(),
            ));
        }
        if !overlay.is_usable() {
            return Err(RegistrationError::UnreadableImage(
                "overlay image is empty or holds non-finite pixels".to_string(),
            ));
        }

        let center = reference.center();
        let radius = (0.5 * (reference.width() as f64).hypot(reference.height() as f64)).max(1.0);

        let initial = match config.init {
            RegistrationInit::Identity => AffineTransform::identity(),
            RegistrationInit::Moments => {
                let fixed = reference.center_of_mass();
                let moving = overlay.center_of_mass();
                AffineTransform::translation(moving[0] - fixed[0], moving[1] - fixed[1])
            }
            RegistrationInit::Manual => config.manual_transform.unwrap_or_default(),
        };

        let (params, scales) = match config.mode {
            RegistrationMode::Rigid => {
                let angle = initial.angle();
                let rotation = AffineTransform::rigid(angle, [0.0, 0.0], [0.0, 0.0]);
                let shift = AffineTransform {
                    matrix: rotation.matrix,
                    offset: initial.offset,
                }
                .shift_about(center);
                (vec![angle, shift[0], shift[1]], vec![radius, 1.0, 1.0])
            }
            _ => {
                let m = initial.matrix;
                let shift = initial.shift_about(center);
                (
                    vec![m[0][0], m[0][1], m[1][0], m[1][1], shift[0], shift[1]],
                    vec![radius, radius, radius, radius, 1.0, 1.0],
                )
            }
        };

        let metric = build_metric(config.metric, config.sampling_stride, config.histogram_bins);

        let mut optimizer = Self {
            reference,
            overlay,
            metric,
            mode: config.mode,
            center,
            params,
            scales,
            step_length: config.initial_step,
            min_step: config.min_step,
            relaxation: config.relaxation,
            max_iterations: config.max_iterations,
            iteration: 0,
            value: f64::NAN,
            previous_direction: None,
            divergence_limit: 10.0 * (radius * 2.0),
        };
        optimizer.value = optimizer.evaluate(&optimizer.params)?;
        Ok(optimizer)
    }

    fn transform_for(&self, params: &[f64]) -> AffineTransform {
        match self.mode {
            RegistrationMode::Rigid => {
                AffineTransform::rigid(params[0], self.center, [params[1], params[2]])
            }
            _ => AffineTransform::about_center(
                [[params[0], params[1]], [params[2], params[3]]],
                self.center,
                [params[4], params[5]],
            ),
        }
    }

    fn evaluate(&self, params: &[f64]) -> Result<f64, RegistrationError> {
        let transform = self.transform_for(params);
        if !transform.is_finite() {
            return Err(RegistrationError::NumericalFailure(
                "transform has non-finite entries".to_string(),
            ));
        }
        let shift = transform.shift_about(self.center);
        if shift[0].hypot(shift[1]) > self.divergence_limit {
            return Err(RegistrationError::NumericalFailure(format!(
                "translation ({:.1}, {:.1}) left the image",
                shift[0], shift[1]
            )));
        }

        let value = self
            .metric
            .evaluate(&self.reference, &self.overlay, &transform)?;
        if !value.is_finite() {
            return Err(RegistrationError::NumericalFailure(format!(
                "metric evaluated to {}",
                value
            )));
        }
        Ok(value)
    }

    /// Metric gradient with respect to the scaled parameters
    fn scaled_gradient(&self) -> Result<Vec<f64>, RegistrationError> {
        let mut gradient = Vec::with_capacity(self.params.len());
        let mut shifted = self.params.clone();
        for i in 0..self.params.len() {
            let h = DIFFERENCE_STEP / self.scales[i];
            shifted[i] = self.params[i] + h;
            let forward = self.evaluate(&shifted)?;
            shifted[i] = self.params[i] - h;
            let backward = self.evaluate(&shifted)?;
            shifted[i] = self.params[i];
            gradient.push((forward - backward) / (2.0 * DIFFERENCE_STEP));
        }
        Ok(gradient)
    }
}

impl IterativeOptimizer for GradientDescentOptimizer {
    fn step(&mut self) -> Result<StepOutcome, RegistrationError> {
        if self.iteration >= self.max_iterations || self.step_length < self.min_step {
            return Ok(StepOutcome::Converged);
        }

        let gradient = self.scaled_gradient()?;
        let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !norm.is_finite() {
            return Err(RegistrationError::NumericalFailure(
                "gradient is not finite".to_string(),
            ));
        }
        if norm <= f64::EPSILON {
            return Ok(StepOutcome::Converged);
        }
        let direction: Vec<f64> = gradient.iter().map(|g| g / norm).collect();

        if let Some(previous) = &self.previous_direction {
            let dot: f64 = previous.iter().zip(&direction).map(|(a, b)| a * b).sum();
            if dot < 0.0 {
                self.step_length *= self.relaxation;
            }
        }
        if self.step_length < self.min_step {
            return Ok(StepOutcome::Converged);
        }

        let candidate: Vec<f64> = self
            .params
            .iter()
            .zip(&direction)
            .zip(&self.scales)
            .map(|((p, d), s)| p - self.step_length * d / s)
            .collect();

        let value = self.evaluate(&candidate)?;

        self.params = candidate;
        self.previous_direction = Some(direction);
        self.value = value;
        self.iteration += 1;
        Ok(StepOutcome::Stepped)
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn iteration(&self) -> u64 {
        self.iteration
    }

    fn transform(&self) -> AffineTransform {
        self.transform_for(&self.params)
    }
}
