//! Glacier Flow Library
//!
//! Surface velocity estimation from pairs of oblique time-lapse photographs.
//! The library provides:
//! - An oblique camera model with yaw/pitch/roll orientation and radial distortion
//! - Ray intersection with gridded digital elevation models
//! - Masked camera calibration on the tiny-solver Levenberg-Marquardt solver
//! - Supersampled normalized cross-correlation patch tracking
//! - A staged pipeline turning tracked pixels into georeferenced velocities
//!
//! Synthetic scene builders and CSV/JSON export helpers round out the crate.

pub mod camera;
pub mod dem;
pub mod geometry;
pub mod optimization;
pub mod pipeline;
pub mod synthetic;
pub mod tracking;
pub mod util;

// Re-export commonly used types
pub use camera::{Camera, CameraModel, CameraModelError, FreeParameterMask, Projection, Resolution};

pub use dem::{DemError, DemSurface};

pub use optimization::{
    optimize_camera, CalibrationError, CalibrationOptions, CalibrationResult, CameraOptimizationCost,
    Correspondence, Optimizer,
};

pub use tracking::{match_template, track_points, MatchParams, MatchResult, TrackPoint, TrackerError};

pub use pipeline::{Pipeline, PipelineConfig, PipelineContext, PipelineError, PipelineResult};

pub use util::GrayImageF32;
