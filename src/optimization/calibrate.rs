//! Masked Levenberg-Marquardt calibration of the oblique [`Camera`].
//!
//! Uses the `tiny_solver` crate with automatic differentiation. Only the free
//! scalars selected by the [`FreeParameterMask`] enter the solver as the single
//! `"params"` variable; fixed scalars are baked into the residual factor.

use crate::camera::oblique::PinholeParams;
use crate::camera::{Camera, FreeParameterMask};
use crate::optimization::{
    check_mask, evaluate, CalibrationError, CalibrationOptions, CalibrationResult,
    Correspondence, Optimizer,
};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Relative step of the central-difference Jacobian used by the convergence test.
const FINITE_DIFFERENCE_STEP: f64 = 1e-6;

/// Reprojection residuals over the free camera parameters.
#[derive(Debug, Clone)]
struct ReprojectionFactor {
    /// Canonical parameter vector of the starting camera.
    base: Vec<f64>,
    /// Canonical indices of the free parameters.
    free: Vec<usize>,
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl ReprojectionFactor {
    fn new(camera: &Camera, mask: &FreeParameterMask, correspondences: &[Correspondence]) -> Self {
        ReprojectionFactor {
            base: camera.parameter_vector().iter().copied().collect(),
            free: mask.free_indices(),
            points3d: correspondences.iter().map(|c| c.world).collect(),
            points2d: correspondences.iter().map(|c| c.pixel).collect(),
        }
    }

    /// Canonical vector with the free slots replaced by `free_values`.
    fn canonical<T: RealField>(&self, free_values: &DVector<T>) -> Vec<T> {
        let mut params: Vec<T> = self.base.iter().map(|v| nalgebra::convert(*v)).collect();
        for (slot, index) in self.free.iter().enumerate() {
            params[*index] = free_values[slot].clone();
        }
        params
    }

    fn residuals<T: RealField>(&self, free_values: &DVector<T>) -> DVector<T> {
        let pinhole = PinholeParams::from_canonical(&self.canonical(free_values));
        let mut residuals = DVector::zeros(self.points2d.len() * 2);

        for (i, (p3d, p2d)) in self.points3d.iter().zip(&self.points2d).enumerate() {
            let world: Vector3<T> = p3d.map(nalgebra::convert);
            let (pixel, _) = pinhole.project(&world);
            residuals[i * 2] = pixel.x.clone() - nalgebra::convert::<f64, T>(p2d.x);
            residuals[i * 2 + 1] = pixel.y.clone() - nalgebra::convert::<f64, T>(p2d.y);
        }
        residuals
    }

    /// Gauss-Newton step at `x` with a central-difference Jacobian. `None` if
    /// the normal equations are singular.
    fn gauss_newton_step(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let r0 = self.residuals(x);
        let mut jacobian = DMatrix::zeros(r0.len(), x.len());
        for j in 0..x.len() {
            let h = FINITE_DIFFERENCE_STEP * (1.0 + x[j].abs());
            let mut forward = x.clone();
            forward[j] += h;
            let mut backward = x.clone();
            backward[j] -= h;
            let column = (self.residuals(&forward) - self.residuals(&backward)) / (2.0 * h);
            jacobian.set_column(j, &column);
        }
        let jtj = jacobian.transpose() * &jacobian;
        let jtr = jacobian.transpose() * r0;
        jtj.cholesky().map(|c| -c.solve(&jtr))
    }
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        self.residuals(&params[0])
    }
}

/// Calibration problem for one [`Camera`].
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use glacier_flow::camera::{Camera, CameraModel, FreeParameterMask, Resolution};
/// use glacier_flow::optimization::{
///     CalibrationOptions, CameraOptimizationCost, Correspondence, Optimizer,
/// };
///
/// let truth = Camera::new(
///     Vector3::new(0.0, 0.0, 50.0),
///     [0.02, -0.1, 0.0],
///     [1000.0, 1000.0],
///     Resolution { width: 800, height: 600 },
/// )
/// .unwrap();
/// let correspondences: Vec<Correspondence> = [(-40.0, 300.0), (25.0, 350.0), (60.0, 500.0), (-10.0, 420.0)]
///     .iter()
///     .map(|&(x, y)| {
///         let world = Vector3::new(x, y, 0.0);
///         Correspondence::new(world, truth.project(&world).pixel)
///     })
///     .collect();
///
/// let start = truth.clone().with_viewdir([0.0, -0.1, 0.0]);
/// let cost = CameraOptimizationCost::new(start, correspondences, FreeParameterMask::rotation_only(1));
/// let result = cost.optimize(&CalibrationOptions::default()).unwrap();
/// assert!((result.camera.viewdir.x - 0.02).abs() < 1e-6);
/// ```
#[derive(Debug, Clone)]
pub struct CameraOptimizationCost {
    camera: Camera,
    correspondences: Vec<Correspondence>,
    mask: FreeParameterMask,
}

impl CameraOptimizationCost {
    /// Creates a new [`CameraOptimizationCost`].
    ///
    /// # Arguments
    ///
    /// * `camera` - Starting camera; its fixed parameters are kept as they are.
    /// * `correspondences` - World points with their observed pixels.
    /// * `mask` - Parameters the solver may change.
    pub fn new(camera: Camera, correspondences: Vec<Correspondence>, mask: FreeParameterMask) -> Self {
        CameraOptimizationCost {
            camera,
            correspondences,
            mask,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    fn fallback(&self, k: usize) -> Result<CalibrationResult, CalibrationError> {
        evaluate(self.camera.clone(), &self.correspondences, k, false)
    }
}

impl Optimizer for CameraOptimizationCost {
    /// Minimizes the squared reprojection error over the free parameters.
    ///
    /// After the solve a Gauss-Newton step is computed at the solution; the
    /// result is flagged converged when every component of that step is within
    /// `tolerance * (1 + |x_i|)`. If the solver gives up, the starting camera is
    /// returned with `converged = false`.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::MaskMismatch`] if the mask and camera disagree on
    ///   the number of distortion coefficients.
    /// * [`CalibrationError::InsufficientCorrespondences`] when there are no
    ///   correspondences or fewer than free parameters.
    fn optimize(&self, options: &CalibrationOptions) -> Result<CalibrationResult, CalibrationError> {
        check_mask(&self.camera, &self.mask)?;
        let n = self.correspondences.len();
        let k = self.mask.free_count();
        if n == 0 || n < k {
            return Err(CalibrationError::InsufficientCorrespondences {
                needed: k.max(1),
                found: n,
            });
        }

        if k == 0 {
            debug!("No free parameters, evaluating camera only");
            return evaluate(self.camera.clone(), &self.correspondences, 0, true);
        }

        let factor = ReprojectionFactor::new(&self.camera, &self.mask, &self.correspondences);
        let initial_params = DVector::from_iterator(k, factor.free.iter().map(|&i| factor.base[i]));

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(n * 2, &["params"], Box::new(factor.clone()), None);

        let mut initial_values = HashMap::new();
        initial_values.insert("params".to_string(), initial_params);

        let solver_options = tiny_solver::OptimizerOptions {
            max_iteration: options.max_iterations,
            verbosity_level: 0,
            min_abs_error_decrease_threshold: 1e-20,
            min_rel_error_decrease_threshold: 1e-14,
            min_error_threshold: 1e-24,
            ..Default::default()
        };

        debug!(
            "Calibrating {} free parameters against {} correspondences",
            k, n
        );
        let optimizer = LevenbergMarquardtOptimizer::default();
        let Some(solution) = optimizer
            .optimize(&problem, &initial_values, Some(solver_options))
            .and_then(|mut result| result.remove("params"))
        else {
            warn!("Levenberg-Marquardt solver failed, keeping the starting camera");
            return self.fallback(k);
        };

        let canonical = DVector::from_vec(factor.canonical(&solution));
        let camera = match self.camera.with_parameter_vector(&canonical) {
            Ok(camera) => camera,
            Err(e) => {
                warn!("Calibration produced an invalid camera ({e}), keeping the starting camera");
                return self.fallback(k);
            }
        };

        let converged = match factor.gauss_newton_step(&solution) {
            Some(step) => {
                debug!("Gauss-Newton step at solution: {:?}", step.as_slice());
                step.iter()
                    .zip(solution.iter())
                    .all(|(dx, x)| dx.abs() <= options.tolerance * (1.0 + x.abs()))
            }
            None => false,
        };

        let result = evaluate(camera, &self.correspondences, k, converged)?;
        if converged {
            info!(
                "Calibration converged: rmse {:.4} px, aic {:.2}, {} free parameters",
                result.rmse, result.aic, k
            );
        } else {
            warn!(
                "Calibration did not converge within {} iterations (rmse {:.4} px)",
                options.max_iterations, result.rmse
            );
        }
        Ok(result)
    }
}

/// Calibrates `camera` against `correspondences`, adjusting only the
/// parameters `mask` leaves free.
pub fn optimize_camera(
    camera: &Camera,
    correspondences: &[Correspondence],
    mask: &FreeParameterMask,
    options: &CalibrationOptions,
) -> Result<CalibrationResult, CalibrationError> {
    CameraOptimizationCost::new(camera.clone(), correspondences.to_vec(), mask.clone()).optimize(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use crate::optimization::compute_reprojection_error;
    use approx::assert_relative_eq;

    fn truth() -> Camera {
        Camera::new(
            Vector3::new(0.0, 0.0, 50.0),
            [0.3, -0.15, 0.01],
            [1500.0, 1510.0],
            Resolution {
                width: 1920,
                height: 1080,
            },
        )
        .unwrap()
        .with_principal_point(Vector2::new(980.0, 530.0))
        .with_distortion(vec![-0.05])
    }

    fn correspondences(camera: &Camera) -> Vec<Correspondence> {
        let mut out = Vec::new();
        for (i, u) in (0..10).map(|i| 100.0 + 190.0 * i as f64).enumerate() {
            for (j, v) in (0..5).map(|j| 100.0 + 210.0 * j as f64).enumerate() {
                let pixel = Vector2::new(u, v);
                let ray = camera.invproject(&pixel, None).unwrap();
                let depth = 200.0 + 50.0 * ((i + 3 * j) % 7) as f64;
                out.push(Correspondence::new(camera.location + ray * depth, pixel));
            }
        }
        out
    }

    fn perturbed(truth: &Camera) -> Camera {
        let start = truth
            .clone()
            .with_viewdir([0.31, -0.155, 0.015])
            .with_principal_point(Vector2::new(983.0, 527.0))
            .with_distortion(vec![0.0]);
        Camera {
            focal_length: Vector2::new(1515.0, 1495.0),
            ..start
        }
    }

    #[test]
    fn test_recovers_ground_truth() {
        let truth = truth();
        let data = correspondences(&truth);
        let start = perturbed(&truth);

        let result = optimize_camera(
            &start,
            &data,
            &FreeParameterMask::all_but_location(1),
            &CalibrationOptions::default(),
        )
        .unwrap();

        assert!(result.converged);
        assert!(result.rmse < 1e-4, "rmse {}", result.rmse);
        assert_eq!(result.free_parameters, 8);
        let cam = &result.camera;
        assert_relative_eq!(cam.viewdir, truth.viewdir, epsilon = 1e-5);
        assert_relative_eq!(cam.focal_length, truth.focal_length, epsilon = 1e-2);
        assert_relative_eq!(cam.principal_point, truth.principal_point, epsilon = 1e-2);
        assert_relative_eq!(cam.distortion[0], truth.distortion[0], epsilon = 1e-5);
        assert_eq!(cam.location, truth.location);
    }

    #[test]
    fn test_iteration_cap_returns_best_estimate() {
        let truth = truth();
        let data = correspondences(&truth);
        let start = perturbed(&truth);
        let mask = FreeParameterMask::all_but_location(1);
        let start_rmse = compute_reprojection_error(&start, &data).unwrap().rmse;

        let capped = CalibrationOptions {
            max_iterations: 2,
            ..Default::default()
        };
        let result = optimize_camera(&start, &data, &mask, &capped).unwrap();
        assert!(!result.converged);
        assert!(result.rmse < start_rmse, "rmse {} vs start {}", result.rmse, start_rmse);
        assert!(result.rmse > 1e-4, "rmse {}", result.rmse);
        assert_eq!(result.camera.location, truth.location);
        assert!(matches!(
            result.into_converged(),
            Err(CalibrationError::Nonconvergent { .. })
        ));

        let single = CalibrationOptions {
            max_iterations: 1,
            ..Default::default()
        };
        let result = optimize_camera(&start, &data, &mask, &single).unwrap();
        assert!(!result.converged);
        assert!(result.rmse.is_finite());
    }

    #[test]
    fn test_rotation_only_keeps_fixed_fields() {
        let truth = truth();
        let data = correspondences(&truth);
        let start = Camera {
            focal_length: Vector2::new(1490.0, 1490.0),
            ..truth.clone().with_viewdir([0.29, -0.14, 0.0]).with_distortion(vec![-0.02])
        };

        let result = optimize_camera(
            &start,
            &data,
            &FreeParameterMask::rotation_only(1),
            &CalibrationOptions::default(),
        )
        .unwrap();

        assert_eq!(result.camera.focal_length, start.focal_length);
        assert_eq!(result.camera.principal_point, start.principal_point);
        assert_eq!(result.camera.distortion, start.distortion);
        assert_eq!(result.camera.location, start.location);
        assert_ne!(result.camera.viewdir, start.viewdir);
        assert_eq!(result.free_parameters, 3);
    }

    #[test]
    fn test_insufficient_correspondences() {
        let truth = truth();
        let data = correspondences(&truth);
        let mask = FreeParameterMask::rotation_only(1);
        let err = optimize_camera(&truth, &data[..2], &mask, &CalibrationOptions::default());
        assert!(matches!(
            err,
            Err(CalibrationError::InsufficientCorrespondences { needed: 3, found: 2 })
        ));

        let err = optimize_camera(&truth, &[], &FreeParameterMask::none(1), &CalibrationOptions::default());
        assert!(matches!(
            err,
            Err(CalibrationError::InsufficientCorrespondences { found: 0, .. })
        ));
    }

    #[test]
    fn test_mask_mismatch() {
        let truth = truth();
        let data = correspondences(&truth);
        let err = optimize_camera(
            &truth,
            &data,
            &FreeParameterMask::rotation_only(2),
            &CalibrationOptions::default(),
        );
        assert!(matches!(
            err,
            Err(CalibrationError::MaskMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_all_fixed_mask_only_evaluates() {
        let truth = truth();
        let data = correspondences(&truth);
        let result = optimize_camera(
            &truth,
            &data,
            &FreeParameterMask::none(1),
            &CalibrationOptions::default(),
        )
        .unwrap();
        assert_eq!(result.camera, truth);
        assert!(result.converged);
        assert!(result.rmse < 1e-6);
        assert_eq!(result.free_parameters, 0);
    }

    #[test]
    fn test_factor_matches_camera_projection() {
        let truth = truth();
        let data = correspondences(&truth);
        let mask = FreeParameterMask::view_focal_k1(1);
        let factor = ReprojectionFactor::new(&truth, &mask, &data);
        let free = DVector::from_iterator(6, factor.free.iter().map(|&i| factor.base[i]));
        let residuals = factor.residuals(&free);
        assert_eq!(residuals.len(), data.len() * 2);
        assert!(residuals.amax() < 1e-6);
    }
}
