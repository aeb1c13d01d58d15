//! 2-D affine transforms mapping reference coordinates into overlay coordinates.

use serde::{Deserialize, Serialize};

/// `q = matrix * p + offset`, with points in pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub matrix: [[f64; 2]; 2],
    pub offset: [f64; 2],
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0], [0.0, 1.0]],
            offset: [0.0, 0.0],
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            offset: [dx, dy],
            ..Self::identity()
        }
    }

    /// Rotation by `angle` radians about `center`, then a shift.
    pub fn rigid(angle: f64, center: [f64; 2], shift: [f64; 2]) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::about_center([[cos, -sin], [sin, cos]], center, shift)
    }

    /// Linear map applied about `center`, then a shift.
    pub fn about_center(matrix: [[f64; 2]; 2], center: [f64; 2], shift: [f64; 2]) -> Self {
        let mapped = apply_matrix(&matrix, center);
        Self {
            matrix,
            offset: [
                center[0] - mapped[0] + shift[0],
                center[1] - mapped[1] + shift[1],
            ],
        }
    }

    /// The shift that, applied about `center`, reproduces this transform.
    pub fn shift_about(&self, center: [f64; 2]) -> [f64; 2] {
        let mapped = apply_matrix(&self.matrix, center);
        [
            self.offset[0] - center[0] + mapped[0],
            self.offset[1] - center[1] + mapped[1],
        ]
    }

    pub fn apply(&self, point: [f64; 2]) -> [f64; 2] {
        let mapped = apply_matrix(&self.matrix, point);
        [mapped[0] + self.offset[0], mapped[1] + self.offset[1]]
    }

    /// Rotation angle of the linear part, ignoring shear and scale.
    pub fn angle(&self) -> f64 {
        self.matrix[1][0].atan2(self.matrix[0][0])
    }

    pub fn determinant(&self) -> f64 {
        self.matrix[0][0] * self.matrix[1][1] - self.matrix[0][1] * self.matrix[1][0]
    }

    pub fn is_finite(&self) -> bool {
        self.matrix.iter().flatten().all(|v| v.is_finite())
            && self.offset.iter().all(|v| v.is_finite())
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

fn apply_matrix(matrix: &[[f64; 2]; 2], point: [f64; 2]) -> [f64; 2] {
    [
        matrix[0][0] * point[0] + matrix[0][1] * point[1],
        matrix[1][0] * point[0] + matrix[1][1] * point[1],
    ]
}
