//! Regular-grid digital elevation model.
//!
//! [`DemSurface`] holds world coordinates along the grid columns (`x`) and rows
//! (`y`), an elevation matrix where `NaN` marks missing data, and two boolean
//! masks co-registered with it: `glaciated` and `visible`.

use nalgebra::{DMatrix, Vector3};

/// Relative tolerance used when checking that grid spacing is uniform.
const SPACING_TOLERANCE: f64 = 1e-6;
/// Ray marching step as a fraction of the smallest cell size.
pub const MARCH_STEP_FRACTION: f64 = 0.5;
/// Maximum bisection iterations when refining a ray/surface crossing.
pub const MAX_BISECTIONS: usize = 100;
/// Bisection stops once the ray-parameter bracket is below this length (metres).
pub const INTERSECTION_TOLERANCE: f64 = 1e-6;

#[derive(thiserror::Error, Debug)]
pub enum DemError {
    #[error("DEM arrays have inconsistent shapes: {0}")]
    ShapeMismatch(String),
    #[error("DEM grid spacing is not regular: {0}")]
    IrregularGrid(String),
    #[error("DEM needs at least 2x2 cells")]
    TooSmall,
}

/// Height field sampled on a regular grid.
///
/// Row `i` of every matrix corresponds to `y[i]` and column `j` to `x[j]`.
/// Coordinates may run in either direction but must be evenly spaced.
#[derive(Debug, Clone)]
pub struct DemSurface {
    x: Vec<f64>,
    y: Vec<f64>,
    z: DMatrix<f64>,
    glaciated: DMatrix<bool>,
    visible: DMatrix<bool>,
    dx: f64,
    dy: f64,
}

fn regular_spacing(coords: &[f64], axis: &str) -> Result<f64, DemError> {
    let step = coords[1] - coords[0];
    if step == 0.0 || !step.is_finite() {
        return Err(DemError::IrregularGrid(format!(
            "{axis} spacing must be non-zero and finite"
        )));
    }
    for (i, pair) in coords.windows(2).enumerate() {
        let d = pair[1] - pair[0];
        if (d - step).abs() > SPACING_TOLERANCE * step.abs() {
            return Err(DemError::IrregularGrid(format!(
                "{axis} step {d} at index {i} differs from {step}"
            )));
        }
    }
    Ok(step)
}

impl DemSurface {
    /// Builds a DEM from its coordinate vectors, elevations and masks.
    ///
    /// # Errors
    ///
    /// * [`DemError::TooSmall`] for fewer than two rows or columns.
    /// * [`DemError::ShapeMismatch`] if a matrix does not match `(y.len(), x.len())`.
    /// * [`DemError::IrregularGrid`] if either axis is unevenly spaced.
    pub fn new(
        x: Vec<f64>,
        y: Vec<f64>,
        z: DMatrix<f64>,
        glaciated: DMatrix<bool>,
        visible: DMatrix<bool>,
    ) -> Result<Self, DemError> {
        if x.len() < 2 || y.len() < 2 {
            return Err(DemError::TooSmall);
        }
        let shape = (y.len(), x.len());
        for (name, dims) in [
            ("z", z.shape()),
            ("glaciated", glaciated.shape()),
            ("visible", visible.shape()),
        ] {
            if dims != shape {
                return Err(DemError::ShapeMismatch(format!(
                    "{name} is {}x{}, expected {}x{}",
                    dims.0, dims.1, shape.0, shape.1
                )));
            }
        }
        let dx = regular_spacing(&x, "x")?;
        let dy = regular_spacing(&y, "y")?;
        Ok(DemSurface {
            x,
            y,
            z,
            glaciated,
            visible,
            dx,
            dy,
        })
    }

    /// Samples `elevation(x, y)` on an ascending grid covering
    /// `[xmin, xmax] x [ymin, ymax]` at `spacing`. Nothing is glaciated and
    /// everything is visible.
    pub fn from_fn<F>(
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
        spacing: f64,
        elevation: F,
    ) -> Result<Self, DemError>
    where
        F: Fn(f64, f64) -> f64,
    {
        if !(spacing > 0.0) {
            return Err(DemError::IrregularGrid("spacing must be positive".to_string()));
        }
        let axis = |lo: f64, hi: f64| -> Vec<f64> {
            let n = ((hi - lo) / spacing + 1e-9).floor().max(0.0) as usize + 1;
            (0..n).map(|i| lo + i as f64 * spacing).collect()
        };
        let x = axis(xmin, xmax);
        let y = axis(ymin, ymax);
        let z = DMatrix::from_fn(y.len(), x.len(), |i, j| elevation(x[j], y[i]));
        let glaciated = DMatrix::from_element(y.len(), x.len(), false);
        let visible = DMatrix::from_element(y.len(), x.len(), true);
        DemSurface::new(x, y, z, glaciated, visible)
    }

    /// Replaces the glaciated mask.
    pub fn with_glaciated(mut self, glaciated: DMatrix<bool>) -> Result<Self, DemError> {
        if glaciated.shape() != self.z.shape() {
            return Err(DemError::ShapeMismatch("glaciated mask".to_string()));
        }
        self.glaciated = glaciated;
        Ok(self)
    }

    /// Replaces the visibility mask.
    pub fn with_visible(mut self, visible: DMatrix<bool>) -> Result<Self, DemError> {
        if visible.shape() != self.z.shape() {
            return Err(DemError::ShapeMismatch("visibility mask".to_string()));
        }
        self.visible = visible;
        Ok(self)
    }

    /// Copy of this surface with every elevation raised by `dz`.
    pub fn with_elevation_offset(&self, dz: f64) -> Self {
        let mut shifted = self.clone();
        shifted.z.add_scalar_mut(dz);
        shifted
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn z(&self) -> &DMatrix<f64> {
        &self.z
    }

    pub fn glaciated(&self) -> &DMatrix<bool> {
        &self.glaciated
    }

    pub fn visible(&self) -> &DMatrix<bool> {
        &self.visible
    }

    /// Absolute cell size `(dx, dy)`.
    pub fn cell_size(&self) -> (f64, f64) {
        (self.dx.abs(), self.dy.abs())
    }

    /// Horizontal extent `(xmin, xmax, ymin, ymax)`.
    pub fn extent(&self) -> (f64, f64, f64, f64) {
        let (x0, x1) = (self.x[0], self.x[self.x.len() - 1]);
        let (y0, y1) = (self.y[0], self.y[self.y.len() - 1]);
        (x0.min(x1), x0.max(x1), y0.min(y1), y0.max(y1))
    }

    /// Fractional `(row, col)` of a world position; `None` outside the grid.
    fn fractional_index(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let col = (x - self.x[0]) / self.dx;
        let row = (y - self.y[0]) / self.dy;
        let max_col = (self.x.len() - 1) as f64;
        let max_row = (self.y.len() - 1) as f64;
        let slack = 1e-9;
        if !(col >= -slack && col <= max_col + slack && row >= -slack && row <= max_row + slack) {
            return None;
        }
        Some((row.clamp(0.0, max_row), col.clamp(0.0, max_col)))
    }

    /// Nearest grid cell `(row, col)` to a world position.
    pub fn cell_index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        self.fractional_index(x, y)
            .map(|(row, col)| (row.round() as usize, col.round() as usize))
    }

    /// Bilinearly interpolated elevation. `None` outside the grid or when a
    /// contributing cell has no data.
    pub fn elevation(&self, x: f64, y: f64) -> Option<f64> {
        let (row, col) = self.fractional_index(x, y)?;
        let i0 = (row.floor() as usize).min(self.y.len() - 2);
        let j0 = (col.floor() as usize).min(self.x.len() - 2);
        let ty = row - i0 as f64;
        let tx = col - j0 as f64;

        let z00 = self.z[(i0, j0)];
        let z01 = self.z[(i0, j0 + 1)];
        let z10 = self.z[(i0 + 1, j0)];
        let z11 = self.z[(i0 + 1, j0 + 1)];
        let value = (1.0 - ty) * ((1.0 - tx) * z00 + tx * z01) + ty * ((1.0 - tx) * z10 + tx * z11);
        value.is_finite().then_some(value)
    }

    /// Visibility mask eroded by a square of half-width `margin_cells`.
    ///
    /// A cell survives only if every cell within `margin_cells` (Chebyshev
    /// distance) is visible. Cells closer than the margin to the grid border
    /// are dropped.
    pub fn eroded_visibility(&self, margin_cells: usize) -> DMatrix<bool> {
        let (rows, cols) = self.visible.shape();
        DMatrix::from_fn(rows, cols, |i, j| {
            if i < margin_cells
                || j < margin_cells
                || i + margin_cells >= rows
                || j + margin_cells >= cols
            {
                return false;
            }
            (i - margin_cells..=i + margin_cells).all(|r| {
                (j - margin_cells..=j + margin_cells).all(|c| self.visible[(r, c)])
            })
        })
    }

    /// Height of the ray above the surface at ray parameter `t`; `NaN` without data.
    fn residual(&self, origin: &Vector3<f64>, direction: &Vector3<f64>, t: f64) -> f64 {
        let p = origin + direction * t;
        self.elevation(p.x, p.y).map_or(f64::NAN, |z| p.z - z)
    }

    /// Ray parameter interval `[t_enter, t_exit]` (with `t >= 0`) where the
    /// ray is inside the horizontal extent.
    fn clip_to_extent(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<(f64, f64)> {
        let (xmin, xmax, ymin, ymax) = self.extent();
        let mut t_enter = 0.0_f64;
        let mut t_exit = f64::INFINITY;
        for (o, d, lo, hi) in [
            (origin.x, direction.x, xmin, xmax),
            (origin.y, direction.y, ymin, ymax),
        ] {
            if d.abs() < 1e-15 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let t0 = (lo - o) / d;
            let t1 = (hi - o) / d;
            t_enter = t_enter.max(t0.min(t1));
            t_exit = t_exit.min(t0.max(t1));
        }
        (t_enter <= t_exit).then_some((t_enter, t_exit))
    }

    /// Intersects the ray `origin + t * direction`, `t >= 0`, with the surface.
    ///
    /// The ray is clipped to the horizontal extent, marched in half-cell steps
    /// until the height above the surface changes sign and then refined by
    /// bisection. Returns `None` when the ray misses the extent, starts below
    /// the surface, or leaves the extent without crossing it. Steps landing on
    /// missing data are skipped.
    pub fn intersect_ray(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<Vector3<f64>> {
        let norm = direction.norm();
        if !(norm > 0.0) || !norm.is_finite() {
            return None;
        }
        let direction = direction / norm;
        let horizontal = direction.xy().norm();

        // Vertical rays either hit directly below the origin or not at all.
        if horizontal < 1e-12 {
            let ground = self.elevation(origin.x, origin.y)?;
            return (direction.z < 0.0 && origin.z >= ground)
                .then(|| Vector3::new(origin.x, origin.y, ground));
        }

        let (t_enter, t_exit) = self.clip_to_extent(origin, &direction)?;
        let (cx, cy) = self.cell_size();
        let step = MARCH_STEP_FRACTION * cx.min(cy) / horizontal;

        let first = self.residual(origin, &direction, t_enter);
        if first < 0.0 {
            return None;
        }

        let mut previous = first.is_finite().then_some((t_enter, first));
        let mut t = t_enter;
        while t < t_exit {
            t = (t + step).min(t_exit);
            let res = self.residual(origin, &direction, t);
            if !res.is_finite() {
                previous = None;
                continue;
            }
            if let Some((t_prev, res_prev)) = previous {
                if res_prev >= 0.0 && res <= 0.0 {
                    let t_hit = self.bisect(origin, &direction, t_prev, t);
                    return Some(origin + direction * t_hit);
                }
            }
            previous = Some((t, res));
        }
        None
    }

    fn bisect(&self, origin: &Vector3<f64>, direction: &Vector3<f64>, mut above: f64, mut below: f64) -> f64 {
        for _ in 0..MAX_BISECTIONS {
            if (below - above).abs() < INTERSECTION_TOLERANCE {
                break;
            }
            let mid = 0.5 * (above + below);
            let res = self.residual(origin, direction, mid);
            if !res.is_finite() {
                break;
            }
            if res > 0.0 {
                above = mid;
            } else {
                below = mid;
            }
        }
        0.5 * (above + below)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tilted_dem() -> DemSurface {
        DemSurface::from_fn(0.0, 1000.0, 0.0, 2000.0, 10.0, |x, y| 100.0 + 0.05 * x + 0.1 * y).unwrap()
    }

    #[test]
    fn test_bilinear_elevation_is_exact_on_planes() {
        let dem = tilted_dem();
        assert_relative_eq!(dem.elevation(123.4, 567.8).unwrap(), 100.0 + 6.17 + 56.78, epsilon = 1e-9);
        assert_relative_eq!(dem.elevation(1000.0, 2000.0).unwrap(), 350.0, epsilon = 1e-9);
        assert!(dem.elevation(-1.0, 10.0).is_none());
        assert_eq!(dem.extent(), (0.0, 1000.0, 0.0, 2000.0));
        assert_eq!(dem.cell_size(), (10.0, 10.0));
    }

    #[test]
    fn test_descending_rows_are_supported() {
        let x = vec![0.0, 1.0, 2.0];
        let y = vec![2.0, 1.0, 0.0];
        let z = DMatrix::from_fn(3, 3, |i, j| x[j] + 10.0 * y[i]);
        let dem = DemSurface::new(
            x,
            y,
            z,
            DMatrix::from_element(3, 3, false),
            DMatrix::from_element(3, 3, true),
        )
        .unwrap();
        assert_relative_eq!(dem.elevation(0.5, 1.5).unwrap(), 15.5, epsilon = 1e-12);
        assert_eq!(dem.cell_index(2.0, 2.0), Some((0, 2)));
    }

    #[test]
    fn test_construction_errors() {
        let ok = DMatrix::from_element(2, 3, 0.0);
        let mask = DMatrix::from_element(2, 3, true);
        assert!(matches!(
            DemSurface::new(vec![0.0], vec![0.0, 1.0], ok.clone(), mask.clone(), mask.clone()),
            Err(DemError::TooSmall)
        ));
        assert!(matches!(
            DemSurface::new(vec![0.0, 1.0, 3.0], vec![0.0, 1.0], ok.clone(), mask.clone(), mask.clone()),
            Err(DemError::IrregularGrid(_))
        ));
        assert!(matches!(
            DemSurface::new(
                vec![0.0, 1.0, 2.0],
                vec![0.0, 1.0],
                ok,
                DMatrix::from_element(3, 2, true),
                mask
            ),
            Err(DemError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_ray_hits_plane() {
        let dem = DemSurface::from_fn(-500.0, 500.0, 0.0, 1000.0, 5.0, |_, _| 0.0).unwrap();
        let origin = Vector3::new(0.0, 0.0, 100.0);
        let direction = Vector3::new(0.1, 1.0, -0.2);
        let hit = dem.intersect_ray(&origin, &direction).unwrap();
        assert_relative_eq!(hit, Vector3::new(50.0, 500.0, 0.0), epsilon = 1e-5);

        let straight_down = dem.intersect_ray(&origin, &Vector3::new(0.0, 0.0, -1.0)).unwrap();
        assert_relative_eq!(straight_down, Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_ray_without_intersection() {
        let dem = DemSurface::from_fn(-500.0, 500.0, 0.0, 1000.0, 5.0, |_, _| 0.0).unwrap();
        let origin = Vector3::new(0.0, 0.0, 100.0);
        // Pointing up
        assert!(dem.intersect_ray(&origin, &Vector3::new(0.0, 1.0, 0.1)).is_none());
        // Too shallow: leaves the extent before reaching the ground
        assert!(dem.intersect_ray(&origin, &Vector3::new(0.0, 1.0, -0.05)).is_none());
        // Pointing away from the extent
        assert!(dem.intersect_ray(&origin, &Vector3::new(0.0, -1.0, -0.5)).is_none());
        // Starting below the surface
        let below = Vector3::new(0.0, 10.0, -5.0);
        assert!(dem.intersect_ray(&below, &Vector3::new(0.0, 1.0, -0.1)).is_none());
    }

    #[test]
    fn test_ray_skips_missing_data() {
        let dem = DemSurface::from_fn(-100.0, 100.0, 0.0, 1000.0, 10.0, |_, y| {
            if (200.0..=400.0).contains(&y) {
                f64::NAN
            } else {
                0.0
            }
        })
        .unwrap();
        let origin = Vector3::new(0.0, 0.0, 100.0);
        // Would hit at y = 300 inside the hole; the first crossing after it wins.
        let hit = dem.intersect_ray(&origin, &Vector3::new(0.0, 1.0, -1.0 / 3.0));
        assert!(hit.map_or(true, |p| p.y > 400.0));
        // Hits beyond the hole normally.
        let hit = dem.intersect_ray(&origin, &Vector3::new(0.0, 1.0, -0.125)).unwrap();
        assert_relative_eq!(hit.y, 800.0, epsilon = 1e-4);
    }

    #[test]
    fn test_eroded_visibility() {
        let mut visible = DMatrix::from_element(7, 7, true);
        visible[(3, 5)] = false;
        let dem = DemSurface::from_fn(0.0, 6.0, 0.0, 6.0, 1.0, |_, _| 0.0)
            .unwrap()
            .with_visible(visible)
            .unwrap();

        let eroded = dem.eroded_visibility(1);
        assert!(!eroded[(0, 3)]);
        assert!(eroded[(1, 1)]);
        assert!(!eroded[(3, 4)]);
        assert!(!eroded[(2, 4)]);
        assert!(eroded[(3, 2)]);
        assert_eq!(dem.eroded_visibility(0), *dem.visible());
        assert_eq!(dem.eroded_visibility(4).iter().filter(|v| **v).count(), 0);
    }

    #[test]
    fn test_elevation_offset() {
        let dem = tilted_dem().with_elevation_offset(-2.5);
        assert_relative_eq!(dem.elevation(0.0, 0.0).unwrap(), 97.5);
    }
}
