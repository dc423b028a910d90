use crate::camera::Resolution;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Axis-aligned pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl PixelRegion {
    pub fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        PixelRegion { x0, y0, x1, y1 }
    }

    /// The whole image shrunk by `inset` pixels on every side.
    pub fn inset(resolution: Resolution, inset: i64) -> Self {
        PixelRegion {
            x0: inset,
            y0: inset,
            x1: resolution.width as i64 - inset,
            y1: resolution.height as i64 - inset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }
}

/// Generate integer pixels at the centres of `spacing`-sized cells tiling `region`.
///
/// # Arguments
///
/// * `region` - Rectangle to cover
/// * `spacing` - Cell size in pixels
///
/// # Returns
///
/// Row-major list of pixel coordinates; empty for an empty region or zero spacing.
pub fn grid_pixels(region: &PixelRegion, spacing: i64) -> Vec<Vector2<i64>> {
    if spacing <= 0 || region.is_empty() {
        return Vec::new();
    }

    let num_cells_x = (region.x1 - region.x0) / spacing;
    let num_cells_y = (region.y1 - region.y0) / spacing;

    let mut points = Vec::with_capacity((num_cells_x * num_cells_y).max(0) as usize);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = region.x0 + j * spacing + spacing / 2;
            let y = region.y0 + i * spacing + spacing / 2;
            points.push(Vector2::new(x, y));
        }
    }
    points
}

/// World positions on a regular grid covering `[xmin, xmax] x [ymin, ymax]`.
pub fn world_grid(extent: (f64, f64, f64, f64), spacing: f64) -> Vec<Vector2<f64>> {
    let (xmin, xmax, ymin, ymax) = extent;
    if !(spacing > 0.0) || xmax < xmin || ymax < ymin {
        return Vec::new();
    }

    let nx = ((xmax - xmin) / spacing + 1e-9).floor() as usize + 1;
    let ny = ((ymax - ymin) / spacing + 1e-9).floor() as usize + 1;
    (0..ny)
        .flat_map(|i| (0..nx).map(move |j| Vector2::new(xmin + j as f64 * spacing, ymin + i as f64 * spacing)))
        .collect()
}
