//! The `optimization` module calibrates [`Camera`] parameters against
//! world/pixel correspondences.
//!
//! Calibration minimizes the squared reprojection error over the scalars a
//! [`FreeParameterMask`] leaves free, holding every other parameter at its
//! current value. The same routine serves a full intrinsic and extrinsic fit
//! from ground control points and a rotation-only fit from tracked features.
//!
//! Fit quality is reported as RMSE in pixels together with the Akaike
//! Information Criterion, which callers compare across masks to decide whether
//! extra distortion or intrinsic terms are justified.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod calibrate;

pub use calibrate::{optimize_camera, CameraOptimizationCost};

use crate::camera::{Camera, CameraModel, CameraModelError, FreeParameterMask};

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Need at least {needed} correspondences, got {found}")]
    InsufficientCorrespondences { needed: usize, found: usize },
    #[error("Mask has {found} distortion flags but the camera has {expected} coefficients")]
    MaskMismatch { expected: usize, found: usize },
    #[error("Calibration did not converge (rmse {rmse:.4} px)")]
    Nonconvergent { rmse: f64 },
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// A world point and the pixel at which it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub world: Vector3<f64>,
    pub pixel: Vector2<f64>,
}

impl Correspondence {
    pub fn new(world: Vector3<f64>, pixel: Vector2<f64>) -> Self {
        Correspondence { world, pixel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Iteration cap handed to the Levenberg-Marquardt solver.
    pub max_iterations: usize,
    /// Relative parameter-update threshold for the convergence test.
    pub tolerance: f64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        CalibrationOptions {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Outcome of one calibration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub camera: Camera,
    /// Root-mean-square reprojection error in pixels over all correspondences.
    pub rmse: f64,
    /// `n ln(SSE / n) + 2k`; lower is better.
    pub aic: f64,
    /// Number of free scalars `k`.
    pub free_parameters: usize,
    pub converged: bool,
    pub reprojection: ProjectionError,
}

impl CalibrationResult {
    /// Turns a soft non-convergence into [`CalibrationError::Nonconvergent`].
    pub fn into_converged(self) -> Result<Self, CalibrationError> {
        if self.converged {
            Ok(self)
        } else {
            Err(CalibrationError::Nonconvergent { rmse: self.rmse })
        }
    }
}

/// A trait for camera calibration tasks.
pub trait Optimizer {
    /// Runs the calibration and reports the fitted camera with its fit quality.
    ///
    /// Failing to meet the convergence tolerance is not an error: the best
    /// estimate is returned with `converged = false`.
    fn optimize(&self, options: &CalibrationOptions) -> Result<CalibrationResult, CalibrationError>;
}

/// Reprojection error statistics of `camera` over `correspondences`.
///
/// # Errors
///
/// * [`CalibrationError::InsufficientCorrespondences`] when the list is empty.
pub fn compute_reprojection_error(
    camera: &Camera,
    correspondences: &[Correspondence],
) -> Result<ProjectionError, CalibrationError> {
    if correspondences.is_empty() {
        return Err(CalibrationError::InsufficientCorrespondences {
            needed: 1,
            found: 0,
        });
    }

    let errors: Vec<f64> = correspondences
        .iter()
        .map(|c| (camera.project(&c.world).pixel - c.pixel).norm())
        .collect();

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted = errors;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

/// Fit quality of `camera` as a [`CalibrationResult`].
pub(crate) fn evaluate(
    camera: Camera,
    correspondences: &[Correspondence],
    free_parameters: usize,
    converged: bool,
) -> Result<CalibrationResult, CalibrationError> {
    let reprojection = compute_reprojection_error(&camera, correspondences)?;
    let n = correspondences.len() as f64;
    let sse = reprojection.rmse.powi(2) * n;
    let aic = n * (sse.max(f64::MIN_POSITIVE) / n).ln() + 2.0 * free_parameters as f64;
    Ok(CalibrationResult {
        camera,
        rmse: reprojection.rmse,
        aic,
        free_parameters,
        converged,
        reprojection,
    })
}

pub(crate) fn check_mask(camera: &Camera, mask: &FreeParameterMask) -> Result<(), CalibrationError> {
    if mask.distortion.len() != camera.distortion.len() {
        return Err(CalibrationError::MaskMismatch {
            expected: camera.distortion.len(),
            found: mask.distortion.len(),
        });
    }
    Ok(())
}
