//! Sub-pixel patch tracking between two images.
//!
//! [`match_template`] extracts a template around a pixel of the first image
//! and a larger search patch around the prior-shifted pixel of the second,
//! supersamples both with cubic convolution, correlates them and returns the
//! displacement together with its quality pair (primary and secondary peak).
//! [`track_points`] runs many independent matches on a rayon thread pool.

use crate::util::GrayImageF32;
use log::debug;
use nalgebra::Vector2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub mod correlation;
pub mod supersample;

use correlation::CorrelationSurface;
use supersample::{extract_patch, upsample, PATCH_MARGIN};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Search radius {search} must exceed template radius {template}")]
    InvalidWindow { template: usize, search: usize },
    #[error("Supersampling factor must be at least 1")]
    InvalidSupersample,
    #[error("Template has near-zero variance ({variance:e})")]
    DegenerateTemplate { variance: f64 },
    #[error("Patch around ({x}, {y}) leaves the image")]
    OutOfFrame { x: i64, y: i64 },
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

/// Window sizes and supersampling shared by a batch of matches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchParams {
    /// Template half-width in native pixels.
    pub template_radius: usize,
    /// Search half-width in native pixels; must exceed `template_radius`.
    pub search_radius: usize,
    /// Integer upsampling factor.
    pub supersample: usize,
    /// Secondary peaks are searched outside this radius (native pixels) around
    /// the primary peak.
    pub exclusion_radius: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        MatchParams {
            template_radius: 10,
            search_radius: 40,
            supersample: 5,
            exclusion_radius: 3.0,
        }
    }
}

impl MatchParams {
    pub fn new(template_radius: usize, search_radius: usize, supersample: usize) -> Self {
        MatchParams {
            template_radius,
            search_radius,
            supersample,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.search_radius <= self.template_radius {
            return Err(TrackerError::InvalidWindow {
                template: self.template_radius,
                search: self.search_radius,
            });
        }
        if self.supersample == 0 {
            return Err(TrackerError::InvalidSupersample);
        }
        Ok(())
    }
}

/// Displacement of one tracked point and its quality pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// `(du, dv)` from image A to image B in native pixels.
    pub displacement: Vector2<f64>,
    pub peak: f64,
    pub secondary_peak: f64,
}

impl MatchResult {
    /// Ratio of the primary to the secondary correlation peak.
    pub fn snr(&self) -> f64 {
        self.peak / self.secondary_peak.max(f64::EPSILON)
    }

    pub fn is_trusted(&self, thresholds: &QualityThresholds) -> bool {
        self.snr() > thresholds.min_snr && self.peak > thresholds.min_peak
    }
}

/// Caller-side acceptance thresholds for match quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub min_snr: f64,
    pub min_peak: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            min_snr: 2.0,
            min_peak: 0.5,
        }
    }
}

/// Integer pixel in image A with an optional prior displacement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub pixel: Vector2<i64>,
    pub prior: Option<Vector2<f64>>,
}

impl TrackPoint {
    pub fn new(pixel: Vector2<i64>, prior: Option<Vector2<f64>>) -> Self {
        TrackPoint { pixel, prior }
    }
}

/// A [`TrackPoint`] with the outcome of matching it.
#[derive(Debug, Clone)]
pub struct TrackedPoint {
    pub point: TrackPoint,
    pub result: Result<MatchResult, TrackerError>,
}

/// Matches the patch around `point` in `image_a` inside `image_b`.
///
/// The prior is rounded to whole pixels before the search patch is placed.
/// The returned displacement is absolute, prior included.
///
/// # Errors
///
/// * [`TrackerError::InvalidWindow`], [`TrackerError::InvalidSupersample`]
///   for bad parameters.
/// * [`TrackerError::OutOfFrame`] if either patch leaves its image.
/// * [`TrackerError::DegenerateTemplate`] for a flat template.
///
/// # Examples
///
/// ```rust
/// use image::{ImageBuffer, Luma};
/// use nalgebra::Vector2;
/// use glacier_flow::tracking::{match_template, MatchParams};
///
/// let image = ImageBuffer::from_fn(64, 64, |x, y| {
///     Luma([((x * 37 + y * 91) % 23) as f32 + ((x * y) % 7) as f32])
/// });
/// let params = MatchParams::new(5, 9, 2);
/// let result = match_template(&image, &image, Vector2::new(32, 32), &params, Vector2::zeros()).unwrap();
/// assert!(result.displacement.norm() < 0.05);
/// assert!((result.peak - 1.0).abs() < 1e-9);
/// ```
pub fn match_template(
    image_a: &GrayImageF32,
    image_b: &GrayImageF32,
    point: Vector2<i64>,
    params: &MatchParams,
    prior: Vector2<f64>,
) -> Result<MatchResult, TrackerError> {
    params.validate()?;
    let out_of_frame = TrackerError::OutOfFrame {
        x: point.x,
        y: point.y,
    };
    // A prior larger than image B can never place the search patch inside it.
    let limit = image_b.width().max(image_b.height()) as f64;
    if !prior.iter().all(|v| v.is_finite() && v.abs() <= limit) {
        return Err(out_of_frame);
    }
    let shift = prior.map(|v| v.round() as i64);
    let centre = match (point.x.checked_add(shift.x), point.y.checked_add(shift.y)) {
        (Some(x), Some(y)) => Vector2::new(x, y),
        _ => return Err(out_of_frame),
    };
    let s = params.supersample;

    let template = extract_patch(image_a, point, params.template_radius, PATCH_MARGIN)?;
    let search = extract_patch(image_b, centre, params.search_radius, PATCH_MARGIN)?;
    let template = upsample(&template, s, PATCH_MARGIN);
    let search = upsample(&search, s, PATCH_MARGIN);

    let surface = CorrelationSurface::compute(&template, &search)?;
    let peak = surface.peak();
    let (dx, dy) = surface.refine(&peak);
    let secondary_peak = surface.secondary_peak(&peak, params.exclusion_radius * s as f64);

    let centre = ((params.search_radius - params.template_radius) * s) as f64;
    let displacement = Vector2::new(
        shift.x as f64 + (peak.x as f64 + dx - centre) / s as f64,
        shift.y as f64 + (peak.y as f64 + dy - centre) / s as f64,
    );

    Ok(MatchResult {
        displacement,
        peak: peak.value,
        secondary_peak,
    })
}

/// Tracks every point independently, in parallel, keeping input order.
///
/// With `threads = Some(n)` the matches run on a dedicated pool of `n`
/// threads, otherwise on the global rayon pool. Per-point failures are kept in
/// the corresponding [`TrackedPoint`]; only invalid parameters or a pool that
/// cannot be built abort the batch.
pub fn track_points(
    image_a: &GrayImageF32,
    image_b: &GrayImageF32,
    points: &[TrackPoint],
    params: &MatchParams,
    threads: Option<usize>,
) -> Result<Vec<TrackedPoint>, TrackerError> {
    params.validate()?;

    let run = || -> Vec<TrackedPoint> {
        points
            .par_iter()
            .map(|point| TrackedPoint {
                point: *point,
                result: match_template(
                    image_a,
                    image_b,
                    point.pixel,
                    params,
                    point.prior.unwrap_or_else(Vector2::zeros),
                ),
            })
            .collect()
    };

    let tracked = match threads {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|idx| format!("tracker-{idx}"))
            .build()
            .map_err(|e| TrackerError::ThreadPool(e.to_string()))?
            .install(run),
        None => run(),
    };

    let failures = tracked.iter().filter(|t| t.result.is_err()).count();
    debug!("Tracked {} points, {} failed", tracked.len(), failures);
    Ok(tracked)
}
