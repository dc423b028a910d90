//! Velocity pipeline coupling calibration and tracking.
//!
//! The pipeline runs eight strictly sequential stages over an explicit
//! [`PipelineContext`]:
//!
//! 1. calibrate camera A from ground control points,
//! 2. estimate a coarse image-to-image shift,
//! 3. refine it on a grid of static terrain points,
//! 4. recalibrate a rotation-only camera B from those shifts,
//! 5. generate glacier candidates from the DEM,
//! 6. predict the camera-shake shift of every candidate,
//! 7. track the candidates seeded by that prediction,
//! 8. georeference the matches into velocities.
//!
//! Every stage is a public function in [`stages`] so it can be run and tested
//! on its own; [`Pipeline::run`] chains them.

use crate::camera::{Camera, CameraModelError, FreeParameterMask};
use crate::dem::{DemError, DemSurface};
use crate::geometry::PixelRegion;
use crate::optimization::{CalibrationError, CalibrationOptions, CalibrationResult};
use crate::tracking::{MatchParams, MatchResult, QualityThresholds, TrackerError};
use crate::util::GrayImageF32;
use log::info;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub mod export;
pub mod stages;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Dem(#[from] DemError),
    #[error("No trusted matches in {0}")]
    NoTrustedMatches(String),
    #[error("No candidate points survived selection")]
    NoCandidates,
    #[error("Acquisition times must be finite with b after a (a = {a}, b = {b})")]
    InvalidTimes { a: f64, b: f64 },
    #[error("Configuration error: {0}")]
    Config(String),
}

/// World point with its observed pixel in image A.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundControlPoint {
    pub world: Vector3<f64>,
    pub pixel: Vector2<f64>,
}

/// Acquisition times of the two images in decimal days.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionTimes {
    pub a: f64,
    pub b: f64,
}

impl AcquisitionTimes {
    /// Time separation `b - a` in days.
    pub fn delta(&self) -> Result<f64, PipelineError> {
        let dt = self.b - self.a;
        if !dt.is_finite() || dt <= 0.0 {
            return Err(PipelineError::InvalidTimes {
                a: self.a,
                b: self.b,
            });
        }
        Ok(dt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarseShiftConfig {
    /// Centre of the large template; image centre when unset.
    pub pixel: Option<[i64; 2]>,
    pub params: MatchParams,
}

impl Default for CoarseShiftConfig {
    fn default() -> Self {
        CoarseShiftConfig {
            pixel: None,
            params: MatchParams::new(60, 100, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridShiftConfig {
    /// Static terrain region; the whole image minus the search margin when unset.
    pub region: Option<PixelRegion>,
    pub spacing: i64,
    pub params: MatchParams,
}

impl Default for GridShiftConfig {
    fn default() -> Self {
        GridShiftConfig {
            region: None,
            spacing: 100,
            params: MatchParams::new(15, 30, 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// World grid spacing in metres.
    pub spacing: f64,
    /// Visibility mask erosion in DEM cells.
    pub margin_cells: usize,
    /// Non-glaciated pixel tracked to monitor residual camera motion.
    pub control_pixel: Option<[i64; 2]>,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        CandidateConfig {
            spacing: 50.0,
            margin_cells: 2,
            control_pixel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub params: MatchParams,
    /// Dedicated worker count; the global rayon pool when unset.
    pub threads: Option<usize>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            params: MatchParams::default(),
            threads: None,
        }
    }
}

/// Pipeline configuration, loadable from YAML.
///
/// Every section has defaults, so a YAML file only needs the values that
/// differ from them.
///
/// # Examples
///
/// ```rust
/// use glacier_flow::pipeline::PipelineConfig;
///
/// let config = PipelineConfig::from_yaml_str(
///     "dz_dt: -0.05\ncandidates:\n  spacing: 25.0\n",
/// )
/// .unwrap();
/// assert_eq!(config.candidates.spacing, 25.0);
/// assert_eq!(config.candidates.margin_cells, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub calibration: CalibrationOptions,
    /// Free parameters of the camera A calibration.
    pub camera_a_mask: FreeParameterMask,
    pub coarse: CoarseShiftConfig,
    pub grid: GridShiftConfig,
    pub candidates: CandidateConfig,
    pub tracking: TrackingConfig,
    pub quality: QualityThresholds,
    /// Expected surface elevation change in metres per day.
    pub dz_dt: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            calibration: CalibrationOptions::default(),
            camera_a_mask: FreeParameterMask::view_focal_k1(1),
            coarse: CoarseShiftConfig::default(),
            grid: GridShiftConfig::default(),
            candidates: CandidateConfig::default(),
            tracking: TrackingConfig::default(),
            quality: QualityThresholds::default(),
            dz_dt: 0.0,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml_string(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::Config(e.to_string()))
    }
}

/// Inputs and configuration shared by every stage.
#[derive(Debug, Clone)]
pub struct PipelineContext<'a> {
    pub image_a: &'a GrayImageF32,
    pub image_b: &'a GrayImageF32,
    pub dem: &'a DemSurface,
    pub gcps: &'a [GroundControlPoint],
    pub times: AcquisitionTimes,
    /// Starting estimate for camera A; its location is kept as surveyed.
    pub camera_a: Camera,
    pub config: PipelineConfig,
}

/// Tracked static-terrain pixel from the grid-shift stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftSample {
    pub pixel: Vector2<i64>,
    pub result: MatchResult,
}

/// Pixel in image A selected for tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub pixel: Vector2<i64>,
    pub is_control: bool,
}

/// Georeferenced velocity of one tracked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityEstimate {
    pub pixel: Vector2<i64>,
    /// Surface position at the first acquisition.
    pub position: Vector3<f64>,
    /// Metres per day.
    pub velocity: Vector3<f64>,
    pub displacement: Vector2<f64>,
    pub peak: f64,
    pub secondary_peak: f64,
    pub trusted: bool,
    pub is_control: bool,
}

impl VelocityEstimate {
    pub fn snr(&self) -> f64 {
        self.peak / self.secondary_peak.max(f64::EPSILON)
    }

    /// Horizontal speed in metres per day.
    pub fn speed(&self) -> f64 {
        self.velocity.xy().norm()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub camera_a: CalibrationResult,
    pub camera_b: CalibrationResult,
    pub coarse_shift: MatchResult,
    pub grid: Vec<ShiftSample>,
    pub velocities: Vec<VelocityEstimate>,
}

pub struct Pipeline<'a> {
    context: PipelineContext<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(context: PipelineContext<'a>) -> Self {
        Pipeline { context }
    }

    pub fn context(&self) -> &PipelineContext<'a> {
        &self.context
    }

    /// Runs all stages in order.
    ///
    /// # Errors
    ///
    /// Configuration and calibration errors abort the run; per-point tracking
    /// and georeferencing failures only drop the affected point.
    pub fn run(&self) -> Result<PipelineResult, PipelineError> {
        let ctx = &self.context;
        ctx.times.delta()?;

        let camera_a = stages::calibrate_camera_a(ctx)?;
        let coarse_shift = stages::coarse_shift(ctx)?;
        let grid = stages::grid_shift(ctx, &coarse_shift)?;
        let camera_b = stages::calibrate_camera_b(ctx, &camera_a.camera, &grid)?;
        let candidates = stages::generate_candidates(ctx, &camera_a.camera)?;
        let seeds = stages::camera_shake(&camera_a.camera, &camera_b.camera, &candidates);
        let tracked = stages::track_candidates(ctx, &seeds)?;
        let velocities =
            stages::georeference(ctx, &camera_a.camera, &camera_b.camera, &candidates, &tracked)?;

        info!(
            "Pipeline finished: {} velocities ({} trusted)",
            velocities.len(),
            velocities.iter().filter(|v| v.trusted).count()
        );

        Ok(PipelineResult {
            camera_a,
            camera_b,
            coarse_shift,
            grid,
            velocities,
        })
    }
}
