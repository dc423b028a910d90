//! Radial lens distortion polynomial and its numerical inverse.
//!
//! Distortion acts on normalized image-plane coordinates `(x, y)` as
//! `(x, y) * (1 + k1 r^2 + k2 r^4 + ...)` with `r^2 = x^2 + y^2`.

use crate::camera::CameraModelError;
use nalgebra::{RealField, Vector2};

/// Maximum Newton iterations when inverting the distortion polynomial.
pub const UNDISTORT_MAX_ITERATIONS: usize = 100;
/// Convergence tolerance on the normalized radius residual.
pub const UNDISTORT_TOLERANCE: f64 = 1e-12;

/// Radial scale factor `1 + k1 r2 + k2 r2^2 + ...`, evaluated with Horner's rule.
pub fn radial_scale<T: RealField>(r2: T, coefficients: &[T]) -> T {
    let mut acc = T::zero();
    for k in coefficients.iter().rev() {
        acc = (acc + k.clone()) * r2.clone();
    }
    acc + T::one()
}

/// Derivative of [`radial_scale`] with respect to `r2`.
fn radial_scale_derivative(r2: f64, coefficients: &[f64]) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .map(|(i, k)| (i as f64 + 1.0) * k * r2.powi(i as i32))
        .sum()
}

/// Applies the distortion to an undistorted normalized point.
pub fn distort(point: &Vector2<f64>, coefficients: &[f64]) -> Vector2<f64> {
    point * radial_scale(point.norm_squared(), coefficients)
}

/// Recovers the undistorted normalized point that distorts onto `distorted`.
///
/// Radial distortion keeps the direction from the optical axis, so the
/// inversion reduces to a scalar Newton solve on the radius
/// `rho * s(rho^2) = rho_d`.
///
/// # Errors
///
/// * [`CameraModelError::NumericalError`] if the derivative vanishes or the
///   iteration does not converge within [`UNDISTORT_MAX_ITERATIONS`].
pub fn undistort(
    distorted: &Vector2<f64>,
    coefficients: &[f64],
) -> Result<Vector2<f64>, CameraModelError> {
    let rho_d = distorted.norm();
    if rho_d == 0.0 || coefficients.iter().all(|k| *k == 0.0) {
        return Ok(*distorted);
    }

    let mut rho = rho_d;
    for _ in 0..UNDISTORT_MAX_ITERATIONS {
        let r2 = rho * rho;
        let scale = radial_scale(r2, coefficients);
        let residual = rho * scale - rho_d;
        if residual.abs() < UNDISTORT_TOLERANCE {
            return Ok(distorted * (rho / rho_d));
        }

        let derivative = scale + 2.0 * r2 * radial_scale_derivative(r2, coefficients);
        if derivative.abs() < f64::EPSILON {
            return Err(CameraModelError::NumericalError(
                "Distortion derivative vanished during undistortion".to_string(),
            ));
        }
        rho -= residual / derivative;
        if !rho.is_finite() || rho < 0.0 {
            return Err(CameraModelError::NumericalError(
                "Undistortion diverged".to_string(),
            ));
        }
    }

    Err(CameraModelError::NumericalError(format!(
        "Undistortion did not converge after {} iterations.",
        UNDISTORT_MAX_ITERATIONS
    )))
}
