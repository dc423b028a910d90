//! Deterministic synthetic scenes for tests and demos.
//!
//! Textures are pure functions of position and seed, so a second view of the
//! same scene can be rendered exactly instead of resampled.

use crate::camera::{Camera, CameraModel, CameraModelError, Resolution};
use crate::dem::{DemError, DemSurface};
use crate::geometry::PixelRegion;
use crate::pipeline::{AcquisitionTimes, GroundControlPoint, PipelineConfig, PipelineContext, PipelineError};
use crate::tracking::MatchParams;
use crate::util::GrayImageF32;
use image::{ImageBuffer, Luma};
use log::debug;
use nalgebra::{DMatrix, Vector2, Vector3};
use rayon::prelude::*;

/// Pseudo-random value in `[0, 1)` for an integer lattice site.
pub fn lattice_hash(x: i64, y: i64, seed: u64) -> f64 {
    let mut h = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
        ^ seed.wrapping_mul(0x1656_67B1_9E37_79F9);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 32;
    (h >> 11) as f64 / (1u64 << 53) as f64
}

/// Smoothly interpolated lattice noise in `[0, 1)` with feature size `cell`.
pub fn value_noise(x: f64, y: f64, cell: f64, seed: u64) -> f64 {
    let (fx, fy) = (x / cell, y / cell);
    let (ix, iy) = (fx.floor(), fy.floor());
    let smooth = |t: f64| t * t * (3.0 - 2.0 * t);
    let (tx, ty) = (smooth(fx - ix), smooth(fy - iy));
    let (ix, iy) = (ix as i64, iy as i64);

    let v00 = lattice_hash(ix, iy, seed);
    let v10 = lattice_hash(ix + 1, iy, seed);
    let v01 = lattice_hash(ix, iy + 1, seed);
    let v11 = lattice_hash(ix + 1, iy + 1, seed);
    (1.0 - ty) * ((1.0 - tx) * v00 + tx * v10) + ty * ((1.0 - tx) * v01 + tx * v11)
}

/// Two octaves of [`value_noise`] scaled to `[0, 255)`.
pub fn noise_intensity(x: f64, y: f64, cell: f64, seed: u64) -> f32 {
    let coarse = value_noise(x, y, cell, seed);
    let fine = value_noise(x, y, 0.5 * cell, seed.wrapping_add(1));
    (255.0 * (0.6 * coarse + 0.4 * fine)) as f32
}

/// Noise texture image sampled at integer pixels.
pub fn noise_texture(width: u32, height: u32, cell: f64, seed: u64) -> GrayImageF32 {
    ImageBuffer::from_fn(width, height, |x, y| {
        Luma([noise_intensity(x as f64, y as f64, cell, seed)])
    })
}

/// Regular lattice of speckle centres spaced `spacing` apart, one of which
/// sits exactly at `anchor`.
pub fn speckle_lattice(width: u32, height: u32, spacing: f64, anchor: Vector2<f64>) -> Vec<Vector2<f64>> {
    let first = |a: f64| a - (a / spacing).floor() * spacing;
    let (x0, y0) = (first(anchor.x), first(anchor.y));
    let mut centres = Vec::new();
    let mut y = y0;
    while y < height as f64 {
        let mut x = x0;
        while x < width as f64 {
            centres.push(Vector2::new(x, y));
            x += spacing;
        }
        y += spacing;
    }
    centres
}

/// Gaussian speckles of standard deviation `sigma` on a flat background,
/// translated by `shift`.
pub fn speckle_image(
    width: u32,
    height: u32,
    centres: &[Vector2<f64>],
    sigma: f64,
    amplitude: f32,
    background: f32,
    shift: Vector2<f64>,
) -> GrayImageF32 {
    let mut image: GrayImageF32 = ImageBuffer::from_pixel(width, height, Luma([background]));
    let reach = (6.0 * sigma).ceil() as i64;
    for centre in centres {
        let c = centre + shift;
        let (cx, cy) = (c.x.round() as i64, c.y.round() as i64);
        for y in (cy - reach).max(0)..=(cy + reach).min(height as i64 - 1) {
            for x in (cx - reach).max(0)..=(cx + reach).min(width as i64 - 1) {
                let r2 = (x as f64 - c.x).powi(2) + (y as f64 - c.y).powi(2);
                let value = amplitude as f64 * (-r2 / (2.0 * sigma * sigma)).exp();
                image.get_pixel_mut(x as u32, y as u32)[0] += value as f32;
            }
        }
    }
    image
}

/// Flat, fully glaciated and fully visible DEM at elevation `z`.
pub fn planar_dem(
    extent: (f64, f64, f64, f64),
    spacing: f64,
    z: f64,
) -> Result<DemSurface, DemError> {
    let (xmin, xmax, ymin, ymax) = extent;
    let dem = DemSurface::from_fn(xmin, xmax, ymin, ymax, spacing, |_, _| z)?;
    let (rows, cols) = dem.z().shape();
    dem.with_glaciated(DMatrix::from_element(rows, cols, true))
}

/// Renders what `camera_b` sees of a scene whose appearance in `camera_a` is
/// `texture(u, v)`. Both cameras must share their location, so the mapping
/// between the two images is independent of scene depth.
pub fn render_rotated_view<F>(
    camera_a: &Camera,
    camera_b: &Camera,
    texture: F,
) -> Result<GrayImageF32, CameraModelError>
where
    F: Fn(f64, f64) -> f32 + Sync,
{
    let resolution = camera_b.get_resolution();
    let width = resolution.width as usize;
    let mut image: GrayImageF32 = ImageBuffer::new(resolution.width, resolution.height);

    image
        .as_mut()
        .par_chunks_mut(width)
        .enumerate()
        .try_for_each(|(v, row)| -> Result<(), CameraModelError> {
            for (u, out) in row.iter_mut().enumerate() {
                let ray = camera_b.invproject(&Vector2::new(u as f64, v as f64), None)?;
                let source = camera_a.project(&(camera_a.location + ray));
                if source.depth <= 0.0 {
                    return Err(CameraModelError::PointBehindCamera);
                }
                *out = texture(source.pixel.x, source.pixel.y);
            }
            Ok(())
        })?;
    Ok(image)
}

/// Renders camera B's view of a surface that moved by `displacement(X)`
/// since image A, whose appearance is `texture(u, v)` in camera A.
///
/// Pixels whose ray misses the DEM fall back to the pure rotation mapping of
/// [`render_rotated_view`].
pub fn render_moving_surface<D, F>(
    camera_a: &Camera,
    camera_b: &Camera,
    dem: &DemSurface,
    displacement: D,
    texture: F,
) -> Result<GrayImageF32, CameraModelError>
where
    D: Fn(&Vector3<f64>) -> Vector3<f64> + Sync,
    F: Fn(f64, f64) -> f32 + Sync,
{
    let resolution = camera_b.get_resolution();
    let width = resolution.width as usize;
    let mut image: GrayImageF32 = ImageBuffer::new(resolution.width, resolution.height);

    image
        .as_mut()
        .par_chunks_mut(width)
        .enumerate()
        .try_for_each(|(v, row)| -> Result<(), CameraModelError> {
            for (u, out) in row.iter_mut().enumerate() {
                let ray = camera_b.invproject(&Vector2::new(u as f64, v as f64), None)?;
                let source = match dem.intersect_ray(&camera_b.location, &ray) {
                    Some(world) => world - displacement(&world),
                    None => camera_a.location + ray,
                };
                let projection = camera_a.project(&source);
                if projection.depth <= 0.0 {
                    return Err(CameraModelError::PointBehindCamera);
                }
                *out = texture(projection.pixel.x, projection.pixel.y);
            }
            Ok(())
        })?;
    Ok(image)
}

/// Parameters of [`GlacierScene::build`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneOptions {
    pub resolution: Resolution,
    /// Yaw of camera B relative to camera A in radians.
    pub yaw_change: f64,
    /// Eastward glacier speed in metres per day.
    pub flow_speed: f64,
    /// Time between the acquisitions in days.
    pub days: f64,
    /// Half-width of the glacier band in metres, centred on `x = 0`.
    pub glacier_half_width: f64,
    /// Texture feature size in pixels.
    pub texture_cell: f64,
    pub seed: u64,
}

impl Default for SceneOptions {
    fn default() -> Self {
        SceneOptions {
            resolution: Resolution {
                width: 400,
                height: 300,
            },
            yaw_change: 0.01,
            flow_speed: 0.2,
            days: 30.0,
            glacier_half_width: 60.0,
            texture_cell: 3.0,
            seed: 7,
        }
    }
}

/// A flat valley floor crossed by a glacier band flowing east, photographed
/// twice from the same station with a slightly rotated camera.
#[derive(Debug, Clone)]
pub struct GlacierScene {
    pub options: SceneOptions,
    pub camera_a: Camera,
    pub camera_b: Camera,
    /// Perturbed camera A used to start calibration.
    pub initial_camera: Camera,
    pub dem: DemSurface,
    pub gcps: Vec<GroundControlPoint>,
    pub image_a: GrayImageF32,
    pub image_b: GrayImageF32,
    /// Static-terrain pixel monitored for residual camera motion.
    pub control_pixel: [i64; 2],
}

impl GlacierScene {
    pub fn build(options: SceneOptions) -> Result<Self, PipelineError> {
        let camera_a = Camera::new(
            Vector3::new(0.0, 0.0, 100.0),
            [0.0, -0.5, 0.0],
            [400.0, 400.0],
            options.resolution,
        )?;
        let camera_b = camera_a
            .clone()
            .with_viewdir([options.yaw_change, -0.5, 0.0]);
        let mut initial_camera = camera_a.clone().with_viewdir([0.02, -0.49, 0.005]);
        initial_camera.focal_length = Vector2::new(410.0, 410.0);

        let dem = planar_dem((-800.0, 800.0, 20.0, 600.0), 10.0, 0.0)?;
        let half_width = options.glacier_half_width;
        let glaciated = DMatrix::from_fn(dem.y().len(), dem.x().len(), |_, col| {
            dem.x()[col].abs() <= half_width
        });
        let dem = dem.with_glaciated(glaciated)?;

        let resolution = camera_a.get_resolution();
        let gcps: Vec<GroundControlPoint> = [200.0, 250.0, 350.0, 500.0]
            .iter()
            .flat_map(|y| {
                [-200.0_f64, -150.0, -100.0, 100.0, 150.0, 200.0].map(|x| Vector3::new(x, *y, 0.0))
            })
            .filter(|world: &Vector3<f64>| world.x.abs() > half_width)
            .map(|world| GroundControlPoint {
                world,
                pixel: camera_a.project(&world).pixel,
            })
            .filter(|gcp| resolution.contains(&gcp.pixel))
            .collect();

        let (cell, seed) = (options.texture_cell, options.seed);
        let image_a = noise_texture(resolution.width, resolution.height, cell, seed);
        let shift = Vector3::new(options.flow_speed * options.days, 0.0, 0.0);
        let image_b = render_moving_surface(
            &camera_a,
            &camera_b,
            &dem,
            |world| {
                if world.x.abs() <= half_width {
                    shift
                } else {
                    Vector3::zeros()
                }
            },
            |u, v| noise_intensity(u, v, cell, seed),
        )?;

        let control = camera_a.project(&Vector3::new(-110.0, 300.0, 0.0)).pixel;
        debug!("Synthetic scene with {} GCPs, control pixel {:?}", gcps.len(), control);

        Ok(GlacierScene {
            options,
            camera_a,
            camera_b,
            initial_camera,
            dem,
            gcps,
            image_a,
            image_b,
            control_pixel: [control.x.round() as i64, control.y.round() as i64],
        })
    }

    /// Stage settings matched to the scene layout: the coarse and grid shifts
    /// look at static terrain left of the glacier.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.coarse.pixel = Some([50, 80]);
        config.coarse.params = MatchParams::new(20, 35, 1);
        config.grid.region = Some(PixelRegion::new(20, 30, 80, 140));
        config.grid.spacing = 20;
        config.grid.params = MatchParams::new(8, 16, 2);
        config.candidates.spacing = 40.0;
        config.candidates.margin_cells = 1;
        config.candidates.control_pixel = Some(self.control_pixel);
        config.tracking.params = MatchParams::new(10, 30, 2);
        config.quality.min_snr = 1.5;
        config
    }

    pub fn context(&self, config: PipelineConfig) -> PipelineContext<'_> {
        PipelineContext {
            image_a: &self.image_a,
            image_b: &self.image_b,
            dem: &self.dem,
            gcps: &self.gcps,
            times: AcquisitionTimes {
                a: 0.0,
                b: self.options.days,
            },
            camera_a: self.initial_camera.clone(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_value_noise_is_continuous_and_bounded() {
        for (x, y) in [(0.0, 0.0), (3.7, 9.1), (-12.5, 4.25)] {
            let v = value_noise(x, y, 3.0, 7);
            assert!((0.0..1.0).contains(&v));
            assert_relative_eq!(v, value_noise(x + 1e-7, y, 3.0, 7), epsilon = 1e-5);
        }
        assert_eq!(value_noise(3.0, 6.0, 3.0, 7), lattice_hash(1, 2, 7));
        assert_ne!(lattice_hash(1, 2, 7), lattice_hash(1, 2, 8));
    }

    #[test]
    fn test_speckles() {
        let centres = speckle_lattice(400, 100, 150.0, Vector2::new(200.0, 50.0));
        assert!(centres.contains(&Vector2::new(200.0, 50.0)));
        assert_eq!(centres.len(), 3);

        let a = speckle_image(400, 100, &centres, 0.8, 180.0, 40.0, Vector2::zeros());
        let b = speckle_image(400, 100, &centres, 0.8, 180.0, 40.0, Vector2::new(2.0, 0.0));
        assert_relative_eq!(a.get_pixel(200, 50)[0], 220.0, epsilon = 1e-4);
        assert_eq!(a.get_pixel(100, 10)[0], 40.0);
        assert_eq!(a.get_pixel(198, 50), b.get_pixel(200, 50));
    }

    #[test]
    fn test_planar_dem() {
        let dem = planar_dem((-100.0, 100.0, 0.0, 50.0), 10.0, 5.0).unwrap();
        assert_eq!(dem.elevation(12.0, 33.0), Some(5.0));
        assert!(dem.glaciated().iter().all(|g| *g));
    }

    #[test]
    fn test_render_identity_view() {
        let camera = Camera::new(
            Vector3::new(0.0, 0.0, 100.0),
            [0.0, -0.4, 0.0],
            [100.0, 100.0],
            Resolution {
                width: 40,
                height: 30,
            },
        )
        .unwrap();
        let image = render_rotated_view(&camera, &camera, |u, v| noise_intensity(u, v, 3.0, 1)).unwrap();
        let reference = noise_texture(40, 30, 3.0, 1);
        for (a, b) in image.pixels().zip(reference.pixels()) {
            assert!((a[0] - b[0]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_static_surface_matches_rotated_view() {
        let scene = GlacierScene::build(SceneOptions {
            flow_speed: 0.0,
            ..Default::default()
        })
        .unwrap();
        let texture = |u: f64, v: f64| noise_intensity(u, v, 3.0, 7);
        let rotated = render_rotated_view(&scene.camera_a, &scene.camera_b, texture).unwrap();
        for (a, b) in scene.image_b.pixels().zip(rotated.pixels()) {
            assert!((a[0] - b[0]).abs() < 0.5);
        }
    }

    #[test]
    fn test_glacier_scene_layout() {
        let scene = GlacierScene::build(SceneOptions::default()).unwrap();
        assert!(scene.gcps.len() >= 10);
        for gcp in &scene.gcps {
            assert!(gcp.world.x.abs() > scene.options.glacier_half_width);
        }
        let glaciated = scene.dem.glaciated().iter().filter(|g| **g).count();
        assert_eq!(glaciated, 13 * scene.dem.y().len());

        let [u, v] = scene.control_pixel;
        assert!((0..400).contains(&u) && (0..300).contains(&v));
        assert_eq!(scene.context(scene.pipeline_config()).times.delta().unwrap(), 30.0);
    }
}
