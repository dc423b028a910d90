//! The individual pipeline stages.

use super::{Candidate, PipelineContext, PipelineError, ShiftSample, VelocityEstimate};
use crate::camera::{Camera, CameraModel, FreeParameterMask};
use crate::geometry::{grid_pixels, world_grid, PixelRegion};
use crate::optimization::{optimize_camera, CalibrationResult, Correspondence};
use crate::tracking::supersample::PATCH_MARGIN;
use crate::tracking::{match_template, track_points, MatchResult, TrackPoint, TrackedPoint};
use log::{debug, info, warn};
use nalgebra::Vector2;
use std::collections::HashSet;

/// Distance along the viewing ray used for grid points whose ray misses the
/// DEM. Camera B shares camera A's location, so any positive depth projects
/// identically.
pub const FALLBACK_RAY_DEPTH: f64 = 1000.0;

/// Calibrates camera A against the ground control points.
pub fn calibrate_camera_a(ctx: &PipelineContext) -> Result<CalibrationResult, PipelineError> {
    let correspondences: Vec<Correspondence> = ctx
        .gcps
        .iter()
        .map(|gcp| Correspondence::new(gcp.world, gcp.pixel))
        .collect();

    let result = optimize_camera(
        &ctx.camera_a,
        &correspondences,
        &ctx.config.camera_a_mask,
        &ctx.config.calibration,
    )?;
    info!(
        "Camera A: {} GCPs, rmse {:.3} px, AIC {:.2}, {:?}",
        correspondences.len(),
        result.rmse,
        result.aic,
        result.camera
    );
    Ok(result)
}

/// One large-template match giving the dominant image-to-image shift.
pub fn coarse_shift(ctx: &PipelineContext) -> Result<MatchResult, PipelineError> {
    let (width, height) = ctx.image_a.dimensions();
    if ctx.image_b.dimensions() != (width, height) {
        return Err(PipelineError::Config(format!(
            "Image sizes differ: {}x{} and {}x{}",
            width,
            height,
            ctx.image_b.width(),
            ctx.image_b.height()
        )));
    }

    let config = &ctx.config.coarse;
    let pixel = match config.pixel {
        Some([x, y]) => Vector2::new(x, y),
        None => Vector2::new(width as i64 / 2, height as i64 / 2),
    };
    let result = match_template(ctx.image_a, ctx.image_b, pixel, &config.params, Vector2::zeros())?;

    if !result.is_trusted(&ctx.config.quality) {
        warn!(
            "Coarse shift at ({}, {}) is weak (peak {:.3}, snr {:.2})",
            pixel.x,
            pixel.y,
            result.peak,
            result.snr()
        );
    }
    info!(
        "Coarse shift: ({:.2}, {:.2}) px",
        result.displacement.x, result.displacement.y
    );
    Ok(result)
}

/// Tracks a regular grid over static terrain, seeded by the coarse shift.
///
/// Only trusted matches are returned.
pub fn grid_shift(ctx: &PipelineContext, coarse: &MatchResult) -> Result<Vec<ShiftSample>, PipelineError> {
    let config = &ctx.config.grid;
    let region = match config.region {
        Some(region) => region,
        None => {
            let reach = coarse.displacement.abs().max().ceil() as i64;
            let inset = (config.params.search_radius + PATCH_MARGIN) as i64 + reach + 1;
            PixelRegion::inset(ctx.camera_a.get_resolution(), inset)
        }
    };

    let points: Vec<TrackPoint> = grid_pixels(&region, config.spacing)
        .into_iter()
        .map(|pixel| TrackPoint::new(pixel, Some(coarse.displacement)))
        .collect();
    let tracked = track_points(ctx.image_a, ctx.image_b, &points, &config.params, None)?;

    let total = tracked.len();
    let samples: Vec<ShiftSample> = tracked
        .into_iter()
        .filter_map(|tracked| match tracked.result {
            Ok(result) if result.is_trusted(&ctx.config.quality) => Some(ShiftSample {
                pixel: tracked.point.pixel,
                result,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!(
                    "Grid point ({}, {}) failed: {e}",
                    tracked.point.pixel.x, tracked.point.pixel.y
                );
                None
            }
        })
        .collect();

    if samples.is_empty() {
        return Err(PipelineError::NoTrustedMatches("grid shift".to_string()));
    }
    info!("Grid shift: {} of {} points trusted", samples.len(), total);
    Ok(samples)
}

/// Recalibrates the orientation of camera B from the grid shifts.
///
/// Camera B starts as a copy of camera A and only its view direction is
/// optimised.
pub fn calibrate_camera_b(
    ctx: &PipelineContext,
    camera_a: &Camera,
    grid: &[ShiftSample],
) -> Result<CalibrationResult, PipelineError> {
    let mut correspondences = Vec::with_capacity(grid.len());
    for sample in grid {
        let pixel = sample.pixel.cast::<f64>();
        let world = match camera_a.invproject(&pixel, Some(ctx.dem)) {
            Ok(world) => world,
            Err(_) => camera_a.location + camera_a.invproject(&pixel, None)? * FALLBACK_RAY_DEPTH,
        };
        correspondences.push(Correspondence::new(world, pixel + sample.result.displacement));
    }

    let mask = FreeParameterMask::rotation_only(camera_a.distortion.len());
    let result = optimize_camera(camera_a, &correspondences, &mask, &ctx.config.calibration)?;
    let dv = result.camera.viewdir - camera_a.viewdir;
    info!(
        "Camera B: rmse {:.3} px, view change ({:.5}, {:.5}, {:.5}) rad",
        result.rmse, dv.x, dv.y, dv.z
    );
    Ok(result)
}

/// Selects glacier pixels in image A from a world grid over the DEM.
///
/// Grid nodes must lie on glaciated cells inside the eroded visibility mask
/// and project inside the frame. Duplicate pixels are dropped, keeping grid
/// order, and the configured control pixel is appended last.
pub fn generate_candidates(ctx: &PipelineContext, camera_a: &Camera) -> Result<Vec<Candidate>, PipelineError> {
    let config = &ctx.config.candidates;
    let visible = ctx.dem.eroded_visibility(config.margin_cells);

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for node in world_grid(ctx.dem.extent(), config.spacing) {
        let Some((row, col)) = ctx.dem.cell_index(node.x, node.y) else {
            continue;
        };
        if !ctx.dem.glaciated()[(row, col)] || !visible[(row, col)] {
            continue;
        }
        let Some(z) = ctx.dem.elevation(node.x, node.y) else {
            continue;
        };

        let projection = camera_a.project(&node.push(z));
        if !projection.in_frame {
            continue;
        }
        let pixel = projection.pixel.map(|v| v.round() as i64);
        if seen.insert(pixel) {
            candidates.push(Candidate {
                pixel,
                is_control: false,
            });
        }
    }

    if let Some([x, y]) = config.control_pixel {
        candidates.push(Candidate {
            pixel: Vector2::new(x, y),
            is_control: true,
        });
    }

    if candidates.is_empty() {
        return Err(PipelineError::NoCandidates);
    }
    info!("Generated {} candidates", candidates.len());
    Ok(candidates)
}

/// Predicts the shift each candidate undergoes from camera A to camera B.
///
/// Candidates whose prediction fails are tracked without a prior.
pub fn camera_shake(camera_a: &Camera, camera_b: &Camera, candidates: &[Candidate]) -> Vec<TrackPoint> {
    candidates
        .iter()
        .map(|candidate| {
            let pixel = candidate.pixel.cast::<f64>();
            let prior = camera_a
                .invproject(&pixel, None)
                .map(|ray| camera_b.project(&(camera_a.location + ray)))
                .ok()
                .filter(|projection| projection.depth > 0.0)
                .map(|projection| projection.pixel - pixel);
            if prior.is_none() {
                warn!(
                    "No camera-shake prior for ({}, {})",
                    candidate.pixel.x, candidate.pixel.y
                );
            }
            TrackPoint::new(candidate.pixel, prior)
        })
        .collect()
}

/// Tracks the seeded candidates with the tracking configuration.
pub fn track_candidates(ctx: &PipelineContext, seeds: &[TrackPoint]) -> Result<Vec<TrackedPoint>, PipelineError> {
    let config = &ctx.config.tracking;
    let tracked = track_points(ctx.image_a, ctx.image_b, seeds, &config.params, config.threads)?;
    let failed = tracked.iter().filter(|t| t.result.is_err()).count();
    info!("Tracked {} candidates, {} failed", tracked.len() - failed, failed);
    Ok(tracked)
}

/// Converts tracked displacements into world velocities.
///
/// The second position is found on the DEM raised by `dz_dt * dt`. Points
/// that failed tracking or whose rays miss the DEM are dropped.
pub fn georeference(
    ctx: &PipelineContext,
    camera_a: &Camera,
    camera_b: &Camera,
    candidates: &[Candidate],
    tracked: &[TrackedPoint],
) -> Result<Vec<VelocityEstimate>, PipelineError> {
    let dt = ctx.times.delta()?;
    let dem_b = ctx.dem.with_elevation_offset(ctx.config.dz_dt * dt);

    let mut untracked = 0;
    let mut unmapped = 0;
    let mut velocities = Vec::with_capacity(tracked.len());
    for (candidate, tracked) in candidates.iter().zip(tracked) {
        let result = match &tracked.result {
            Ok(result) => result,
            Err(_) => {
                untracked += 1;
                continue;
            }
        };

        let pixel = candidate.pixel.cast::<f64>();
        let positions = camera_a
            .invproject(&pixel, Some(ctx.dem))
            .and_then(|a| Ok((a, camera_b.invproject(&(pixel + result.displacement), Some(&dem_b))?)));
        let (position_a, position_b) = match positions {
            Ok(positions) => positions,
            Err(e) => {
                debug!("Cannot georeference ({}, {}): {e}", candidate.pixel.x, candidate.pixel.y);
                unmapped += 1;
                continue;
            }
        };

        velocities.push(VelocityEstimate {
            pixel: candidate.pixel,
            position: position_a,
            velocity: (position_b - position_a) / dt,
            displacement: result.displacement,
            peak: result.peak,
            secondary_peak: result.secondary_peak,
            trusted: result.is_trusted(&ctx.config.quality),
            is_control: candidate.is_control,
        });
    }

    if untracked + unmapped > 0 {
        warn!(
            "Dropped {} points ({} failed tracking, {} missed the DEM)",
            untracked + unmapped,
            untracked,
            unmapped
        );
    }
    Ok(velocities)
}
