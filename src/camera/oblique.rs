//! Implements the oblique terrain camera.
//!
//! [`Camera`] is a pinhole camera with a radial distortion polynomial placed at
//! a surveyed world location. World coordinates are x east, y north, z up.
//! With a zero view direction the camera looks due north with the image `u`
//! axis pointing east and `v` pointing down.
//!
//! The projection is written once, generically over [`RealField`], so that the
//! calibration engine can differentiate it automatically with the same code the
//! rest of the crate uses for plain `f64` projection.

use crate::camera::radial::{radial_scale, undistort};
use crate::camera::{validation, CameraModel, CameraModelError, Resolution};
use crate::dem::DemSurface;
use nalgebra::{DVector, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::{Yaml, YamlLoader};

/// Result of projecting a world point into the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Pixel coordinates `(u, v)`; non-finite when the point sits on the camera plane.
    pub pixel: Vector2<f64>,
    /// Distance along the optical axis; positive in front of the camera.
    pub depth: f64,
    /// `depth > 0` and the pixel lies inside the image.
    pub in_frame: bool,
}

/// Rotation from world to camera frame for a yaw/pitch/roll view direction.
///
/// The world is first turned so the camera looks north (`+z` north, `+y` down),
/// then yawed clockwise from north, pitched up and rolled about the optical axis.
#[rustfmt::skip]
pub fn rotation_matrix<T: RealField>(yaw: T, pitch: T, roll: T) -> Matrix3<T> {
    let (s1, c1) = (yaw.clone().sin(), yaw.cos());
    let (s2, c2) = (pitch.clone().sin(), pitch.cos());
    let (s3, c3) = (roll.clone().sin(), roll.cos());
    let zero = T::zero();
    let one = T::one();

    let to_north = Matrix3::new(
        one.clone(), zero.clone(), zero.clone(),
        zero.clone(), zero.clone(), -one.clone(),
        zero.clone(), one.clone(), zero.clone(),
    );
    let yaw_rot = Matrix3::new(
        c1.clone(), zero.clone(), -s1.clone(),
        zero.clone(), one.clone(), zero.clone(),
        s1, zero.clone(), c1,
    );
    let pitch_rot = Matrix3::new(
        one.clone(), zero.clone(), zero.clone(),
        zero.clone(), c2.clone(), s2.clone(),
        zero.clone(), -s2, c2,
    );
    let roll_rot = Matrix3::new(
        c3.clone(), s3.clone(), zero.clone(),
        -s3, c3, zero.clone(),
        zero.clone(), zero, one,
    );
    roll_rot * pitch_rot * yaw_rot * to_north
}

/// Camera parameters in a scalar type suitable for automatic differentiation.
#[derive(Debug, Clone)]
pub(crate) struct PinholeParams<T: RealField> {
    location: Vector3<T>,
    rotation: Matrix3<T>,
    focal_length: Vector2<T>,
    principal_point: Vector2<T>,
    distortion: Vec<T>,
}

impl<T: RealField> PinholeParams<T> {
    /// Builds the parameters from a canonical vector
    /// `[location(3), viewdir(3), focal(2), principal(2), distortion(k)]`.
    pub(crate) fn from_canonical(params: &[T]) -> Self {
        PinholeParams {
            location: Vector3::new(params[0].clone(), params[1].clone(), params[2].clone()),
            rotation: rotation_matrix(params[3].clone(), params[4].clone(), params[5].clone()),
            focal_length: Vector2::new(params[6].clone(), params[7].clone()),
            principal_point: Vector2::new(params[8].clone(), params[9].clone()),
            distortion: params[10..].to_vec(),
        }
    }

    /// Projects a world point, returning the pixel and depth.
    pub(crate) fn project(&self, world: &Vector3<T>) -> (Vector2<T>, T) {
        let cam = &self.rotation * (world - &self.location);
        let depth = cam.z.clone();
        let x = cam.x.clone() / depth.clone();
        let y = cam.y.clone() / depth.clone();
        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let scale = radial_scale(r2, &self.distortion);

        let u = self.focal_length.x.clone() * x * scale.clone() + self.principal_point.x.clone();
        let v = self.focal_length.y.clone() * y * scale + self.principal_point.y.clone();
        (Vector2::new(u, v), depth)
    }
}

/// Represents an oblique terrain camera.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use glacier_flow::camera::{Camera, CameraModel, Resolution};
///
/// let camera = Camera::new(
///     Vector3::new(0.0, 0.0, 100.0),
///     [0.0, -0.3, 0.0],
///     [1000.0, 1000.0],
///     Resolution { width: 1200, height: 800 },
/// )
/// .unwrap();
///
/// let projection = camera.project(&Vector3::new(0.0, 1000.0, 100.0));
/// assert!(projection.in_frame);
/// assert!(projection.depth > 0.0);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Surveyed camera position (x east, y north, z up).
    pub location: Vector3<f64>,
    /// View direction `[yaw, pitch, roll]` in radians.
    pub viewdir: Vector3<f64>,
    /// Focal lengths `[fx, fy]` in pixels.
    pub focal_length: Vector2<f64>,
    /// Principal point `[cx, cy]` in pixels.
    pub principal_point: Vector2<f64>,
    /// Radial distortion coefficients `[k1, k2, ...]`.
    pub distortion: Vec<f64>,
    pub resolution: Resolution,
}

impl Camera {
    /// Creates a camera with the principal point at the image centre and a
    /// single zero distortion coefficient.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::InvalidParams`] for non-finite location or view direction.
    pub fn new(
        location: Vector3<f64>,
        viewdir: [f64; 3],
        focal_length: [f64; 2],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let camera = Camera {
            location,
            viewdir: Vector3::from(viewdir),
            focal_length: Vector2::from(focal_length),
            principal_point: resolution.center(),
            distortion: vec![0.0],
            resolution,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    pub fn with_distortion(mut self, distortion: Vec<f64>) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn with_principal_point(mut self, principal_point: Vector2<f64>) -> Self {
        self.principal_point = principal_point;
        self
    }

    pub fn with_viewdir(mut self, viewdir: [f64; 3]) -> Self {
        self.viewdir = Vector3::from(viewdir);
        self
    }

    /// Number of scalars in the canonical parameter vector.
    pub fn parameter_count(&self) -> usize {
        10 + self.distortion.len()
    }

    /// Canonical parameter vector
    /// `[location(3), viewdir(3), focal(2), principal(2), distortion(k)]`.
    pub fn parameter_vector(&self) -> DVector<f64> {
        let mut params = Vec::with_capacity(self.parameter_count());
        params.extend(self.location.iter());
        params.extend(self.viewdir.iter());
        params.extend(self.focal_length.iter());
        params.extend(self.principal_point.iter());
        params.extend(self.distortion.iter());
        DVector::from_vec(params)
    }

    /// Returns a copy of this camera with parameters taken from a canonical vector.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if the vector length does not match.
    /// * Validation errors for the new values.
    pub fn with_parameter_vector(&self, params: &DVector<f64>) -> Result<Self, CameraModelError> {
        if params.len() != self.parameter_count() {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected {} camera parameters, got {}",
                self.parameter_count(),
                params.len()
            )));
        }
        let camera = Camera {
            location: Vector3::new(params[0], params[1], params[2]),
            viewdir: Vector3::new(params[3], params[4], params[5]),
            focal_length: Vector2::new(params[6], params[7]),
            principal_point: Vector2::new(params[8], params[9]),
            distortion: params.iter().skip(10).copied().collect(),
            resolution: self.resolution,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// World-to-camera rotation.
    pub fn rotation(&self) -> Matrix3<f64> {
        rotation_matrix(self.viewdir.x, self.viewdir.y, self.viewdir.z)
    }

    pub(crate) fn pinhole(&self) -> PinholeParams<f64> {
        PinholeParams {
            location: self.location,
            rotation: self.rotation(),
            focal_length: self.focal_length,
            principal_point: self.principal_point,
            distortion: self.distortion.clone(),
        }
    }

    fn projection_from(&self, pinhole: &PinholeParams<f64>, world: &Vector3<f64>) -> Projection {
        let (pixel, depth) = pinhole.project(world);
        let in_frame = depth > 0.0
            && pixel.x.is_finite()
            && pixel.y.is_finite()
            && self.resolution.contains(&pixel);
        Projection {
            pixel,
            depth,
            in_frame,
        }
    }

    /// Projects many world points at once, returning pixels and in-frame flags.
    pub fn project_points(&self, points: &[Vector3<f64>]) -> (Vec<Vector2<f64>>, Vec<bool>) {
        let pinhole = self.pinhole();
        points
            .iter()
            .map(|p| {
                let projection = self.projection_from(&pinhole, p);
                (projection.pixel, projection.in_frame)
            })
            .unzip()
    }

    /// Inverse projection of a pixel.
    ///
    /// Without a DEM the unit ray direction in world coordinates is returned.
    /// With a DEM the ray from [`Camera::location`] is intersected with the
    /// surface and the 3-D intersection point is returned.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`] if undistortion fails.
    /// * [`CameraModelError::NoIntersection`] if the ray misses the DEM.
    pub fn invproject(
        &self,
        pixel: &Vector2<f64>,
        dem: Option<&DemSurface>,
    ) -> Result<Vector3<f64>, CameraModelError> {
        let direction = self.ray_direction(pixel)?;
        match dem {
            None => Ok(direction),
            Some(dem) => dem
                .intersect_ray(&self.location, &direction)
                .ok_or(CameraModelError::NoIntersection),
        }
    }
}

/// Provides a debug string representation for [`Camera`].
impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Camera [location: ({:.3}, {:.3}, {:.3}) viewdir: ({:.6}, {:.6}, {:.6}) f: ({:.3}, {:.3}) c: ({:.3}, {:.3}) k: {:?} {}x{}]",
            self.location.x,
            self.location.y,
            self.location.z,
            self.viewdir.x,
            self.viewdir.y,
            self.viewdir.z,
            self.focal_length.x,
            self.focal_length.y,
            self.principal_point.x,
            self.principal_point.y,
            self.distortion,
            self.resolution.width,
            self.resolution.height,
        )
    }
}

fn yaml_f64_list(doc: &Yaml, key: &str, expected: Option<usize>) -> Result<Vec<f64>, CameraModelError> {
    let node = doc[key].as_vec().ok_or_else(|| {
        CameraModelError::InvalidParams(format!("YAML missing '{key}' or not an array"))
    })?;
    if let Some(n) = expected {
        if node.len() != n {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected {n} values for '{key}', found {}",
                node.len()
            )));
        }
    }
    node.iter()
        .enumerate()
        .map(|(i, v)| {
            // Integers written without a decimal point parse as Yaml::Integer.
            v.as_f64()
                .or_else(|| v.as_i64().map(|x| x as f64))
                .ok_or_else(|| {
                    CameraModelError::InvalidParams(format!("Invalid '{key}' value at index {i}"))
                })
        })
        .collect()
}

impl CameraModel for Camera {
    /// Projects a world point into the image.
    ///
    /// Transforms into the camera frame, divides by depth, applies the radial
    /// distortion to the normalized coordinates and finally scales by the focal
    /// lengths and offsets by the principal point.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nalgebra::Vector3;
    /// use glacier_flow::camera::{Camera, CameraModel, Resolution};
    ///
    /// let camera = Camera::new(
    ///     Vector3::zeros(),
    ///     [0.0, 0.0, 0.0],
    ///     [1000.0, 1000.0],
    ///     Resolution { width: 1000, height: 800 },
    /// )
    /// .unwrap();
    /// // 1000 m north, 100 m east, 50 m below the camera
    /// let p = camera.project(&Vector3::new(100.0, 1000.0, -50.0));
    /// assert!((p.pixel.x - 599.5).abs() < 1e-9);
    /// assert!((p.pixel.y - 449.5).abs() < 1e-9);
    /// ```
    fn project(&self, world: &Vector3<f64>) -> Projection {
        self.projection_from(&self.pinhole(), world)
    }

    /// Unit ray direction in world coordinates through a pixel.
    ///
    /// The pixel is normalized by the intrinsics, undistorted by Newton
    /// iteration on the radial model and rotated back into the world frame.
    fn ray_direction(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let distorted = Vector2::new(
            (pixel.x - self.principal_point.x) / self.focal_length.x,
            (pixel.y - self.principal_point.y) / self.focal_length.y,
        );
        let normalized = undistort(&distorted, &self.distortion)?;
        let ray_cam = Vector3::new(normalized.x, normalized.y, 1.0);
        Ok((self.rotation().transpose() * ray_cam).normalize())
    }

    /// Loads camera parameters from a YAML file.
    ///
    /// Expected layout:
    ///
    /// ```yaml
    /// cam0:
    ///   camera_model: oblique
    ///   location: [x, y, z]
    ///   viewdir: [yaw, pitch, roll]
    ///   intrinsics: [fx, fy, cx, cy]
    ///   distortion: [k1]
    ///   resolution: [width, height]
    /// ```
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`], [`CameraModelError::YamlError`]
    /// * [`CameraModelError::InvalidParams`] for missing or malformed fields.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs.first().ok_or_else(|| {
            CameraModelError::InvalidParams("Empty YAML document".to_string())
        })?;
        let cam = &doc["cam0"];

        let location = yaml_f64_list(cam, "location", Some(3))?;
        let viewdir = yaml_f64_list(cam, "viewdir", Some(3))?;
        let intrinsics = yaml_f64_list(cam, "intrinsics", Some(4))?;
        let distortion = yaml_f64_list(cam, "distortion", None)?;
        let resolution = yaml_f64_list(cam, "resolution", Some(2))?;

        let camera = Camera {
            location: Vector3::new(location[0], location[1], location[2]),
            viewdir: Vector3::new(viewdir[0], viewdir[1], viewdir[2]),
            focal_length: Vector2::new(intrinsics[0], intrinsics[1]),
            principal_point: Vector2::new(intrinsics[2], intrinsics[3]),
            distortion,
            resolution: Resolution {
                width: resolution[0] as u32,
                height: resolution[1] as u32,
            },
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Saves the camera parameters to a YAML file readable by
    /// [`Camera::load_from_yaml`].
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let to_value = |v: Vec<f64>| {
            serde_yaml::to_value(v).map_err(|e| CameraModelError::YamlError(e.to_string()))
        };

        let cam0 = serde_yaml::Mapping::from_iter([
            (
                serde_yaml::Value::String("camera_model".to_string()),
                serde_yaml::Value::String("oblique".to_string()),
            ),
            (
                serde_yaml::Value::String("location".to_string()),
                to_value(self.location.iter().copied().collect())?,
            ),
            (
                serde_yaml::Value::String("viewdir".to_string()),
                to_value(self.viewdir.iter().copied().collect())?,
            ),
            (
                serde_yaml::Value::String("intrinsics".to_string()),
                to_value(vec![
                    self.focal_length.x,
                    self.focal_length.y,
                    self.principal_point.x,
                    self.principal_point.y,
                ])?,
            ),
            (
                serde_yaml::Value::String("distortion".to_string()),
                to_value(self.distortion.clone())?,
            ),
            (
                serde_yaml::Value::String("resolution".to_string()),
                serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                    .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
            ),
        ]);
        let yaml = serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::Value::Mapping(cam0),
        )]);

        let yaml_string =
            serde_yaml::to_string(&yaml).map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.focal_length, &self.principal_point)?;
        if !self.location.iter().all(|v| v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Camera location must be finite".to_string(),
            ));
        }
        if !self.viewdir.iter().all(|v| v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "View direction must be finite".to_string(),
            ));
        }
        if !self.distortion.iter().all(|v| v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }
}
