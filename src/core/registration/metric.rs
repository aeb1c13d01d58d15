//! Image similarity metrics. Every metric is minimized.

use crate::core::image::IntensityImage;
use crate::error::RegistrationError;

use super::{AffineTransform, RegistrationMetric};

/// Fewer overlapping samples than this fraction of the grid is a failure.
const MIN_OVERLAP_FRACTION: f64 = 0.1;

/// Scores how well the overlay matches the reference under a transform.
pub trait SimilarityMetric: Send {
    /// Lower is better. Fails when too little of the reference maps into the overlay.
    fn evaluate(
        &self,
        reference: &IntensityImage,
        overlay: &IntensityImage,
        transform: &AffineTransform,
    ) -> Result<f64, RegistrationError>;

    fn kind(&self) -> RegistrationMetric;
}

/// Build the metric implementation for a configured kind
pub fn build_metric(
    kind: RegistrationMetric,
    sampling_stride: u32,
    histogram_bins: usize,
) -> Box<dyn SimilarityMetric> {
    let stride = sampling_stride.max(1);
    match kind {
        RegistrationMetric::MeanSquares => Box::new(MeanSquares { stride }),
        RegistrationMetric::CrossCorrelation => Box::new(CrossCorrelation { stride }),
        RegistrationMetric::MutualInformation => Box::new(MutualInformation {
            stride,
            bins: histogram_bins.max(2),
        }),
    }
}

/// Pairs of (reference, overlay) intensities on the sampling grid.
fn sample_pairs(
    reference: &IntensityImage,
    overlay: &IntensityImage,
    transform: &AffineTransform,
    stride: u32,
) -> Result<Vec<(f64, f64)>, RegistrationError> {
    let mut pairs = Vec::new();
    let mut grid_points = 0usize;

    for y in (0..reference.height()).step_by(stride as usize) {
        for x in (0..reference.width()).step_by(stride as usize) {
            grid_points += 1;
            let mapped = transform.apply([x as f64, y as f64]);
            if let Some(moving) = overlay.sample(mapped[0], mapped[1]) {
                if let Some(fixed) = reference.get(x, y) {
                    pairs.push((fixed as f64, moving));
                }
            }
        }
    }

    let required = ((grid_points as f64 * MIN_OVERLAP_FRACTION).ceil() as usize).max(4);
    if pairs.len() < required {
        return Err(RegistrationError::NumericalFailure(format!(
            "only {} of {} samples map inside the overlay",
            pairs.len(),
            grid_points
        )));
    }
    Ok(pairs)
}

/// Mean of squared intensity differences
pub struct MeanSquares {
    stride: u32,
}

impl SimilarityMetric for MeanSquares {
    fn evaluate(
        &self,
        reference: &IntensityImage,
        overlay: &IntensityImage,
        transform: &AffineTransform,
    ) -> Result<f64, RegistrationError> {
        let pairs = sample_pairs(reference, overlay, transform, self.stride)?;
        let sum: f64 = pairs.iter().map(|(f, m)| (f - m) * (f - m)).sum();
        Ok(sum / pairs.len() as f64)
    }

    fn kind(&self) -> RegistrationMetric {
        RegistrationMetric::MeanSquares
    }
}

/// Negated normalized cross-correlation
pub struct CrossCorrelation {
    stride: u32,
}

impl SimilarityMetric for CrossCorrelation {
    fn evaluate(
        &self,
        reference: &IntensityImage,
        overlay: &IntensityImage,
        transform: &AffineTransform,
    ) -> Result<f64, RegistrationError> {
        let pairs = sample_pairs(reference, overlay, transform, self.stride)?;
        let n = pairs.len() as f64;
        let mean_f = pairs.iter().map(|(f, _)| f).sum::<f64>() / n;
        let mean_m = pairs.iter().map(|(_, m)| m).sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var_f = 0.0;
        let mut var_m = 0.0;
        for (f, m) in &pairs {
            let df = f - mean_f;
            let dm = m - mean_m;
            cov += df * dm;
            var_f += df * df;
            var_m += dm * dm;
        }

        let denom = (var_f * var_m).sqrt();
        if denom <= f64::EPSILON {
            return Ok(0.0);
        }
        Ok(-cov / denom)
    }

    fn kind(&self) -> RegistrationMetric {
        RegistrationMetric::CrossCorrelation
    }
}

/// Negated mutual information over a joint histogram.
///
/// Each sample is spread over the two nearest bins on each axis so the
/// value changes smoothly with the transform.
pub struct MutualInformation {
    stride: u32,
    bins: usize,
}

impl MutualInformation {
    fn bin_weights(&self, value: f64, lo: f64, hi: f64) -> [(usize, f64); 2] {
        let last = (self.bins - 1) as f64;
        let position = if hi > lo {
            ((value - lo) / (hi - lo) * last).clamp(0.0, last)
        } else {
            0.0
        };
        let lower = position.floor();
        let frac = position - lower;
        let lower = lower as usize;
        let upper = (lower + 1).min(self.bins - 1);
        [(lower, 1.0 - frac), (upper, frac)]
    }
}

impl SimilarityMetric for MutualInformation {
    fn evaluate(
        &self,
        reference: &IntensityImage,
        overlay: &IntensityImage,
        transform: &AffineTransform,
    ) -> Result<f64, RegistrationError> {
        let pairs = sample_pairs(reference, overlay, transform, self.stride)?;
        let (f_lo, f_hi) = reference.range().unwrap_or((0.0, 0.0));
        let (m_lo, m_hi) = overlay.range().unwrap_or((0.0, 0.0));

        let bins = self.bins;
        let mut joint = vec![0.0f64; bins * bins];
        for (f, m) in &pairs {
            let fw = self.bin_weights(*f, f_lo as f64, f_hi as f64);
            let mw = self.bin_weights(*m, m_lo as f64, m_hi as f64);
            for (fi, fweight) in fw {
                for (mi, mweight) in mw {
                    joint[fi * bins + mi] += fweight * mweight;
                }
            }
        }

        let total: f64 = joint.iter().sum();
        let mut marginal_f = vec![0.0f64; bins];
        let mut marginal_m = vec![0.0f64; bins];
        for fi in 0..bins {
            for mi in 0..bins {
                let p = joint[fi * bins + mi] / total;
                marginal_f[fi] += p;
                marginal_m[mi] += p;
            }
        }

        let mut mi_value = 0.0;
        for fi in 0..bins {
            for mi in 0..bins {
                let p = joint[fi * bins + mi] / total;
                if p > 0.0 {
                    mi_value += p * (p / (marginal_f[fi] * marginal_m[mi])).ln();
                }
            }
        }
        Ok(-mi_value)
    }

    fn kind(&self) -> RegistrationMetric {
        RegistrationMetric::MutualInformation
    }
}
