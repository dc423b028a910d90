//! Oblique terrain camera: parameters, projection and persistence.
//!
//! The [`Camera`] type models a pinhole camera with a radial distortion
//! polynomial, placed at a known world location and oriented by a
//! yaw/pitch/roll view direction. [`FreeParameterMask`] selects which of its
//! scalar parameters a calibration may adjust.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod mask;
pub mod oblique;
pub mod radial;

pub use mask::FreeParameterMask;
pub use oblique::{Camera, Projection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Image centre in pixel coordinates, where `(0, 0)` is the centre of the
    /// top-left pixel.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        )
    }

    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.x < self.width as f64
            && pixel.y >= 0.0
            && pixel.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Point lies behind the camera")]
    PointBehindCamera,
    #[error("Ray does not intersect the DEM surface")]
    NoIntersection,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Core functionality shared by camera models used for georeferencing.
pub trait CameraModel {
    /// Project a world point into the image.
    fn project(&self, world: &Vector3<f64>) -> Projection;

    /// Unit ray direction (world frame) through a pixel.
    fn ray_direction(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(
        focal_length: &Vector2<f64>,
        principal_point: &Vector2<f64>,
    ) -> Result<(), CameraModelError> {
        if !(focal_length.x > 0.0 && focal_length.y > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !principal_point.x.is_finite() || !principal_point.y.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}
