//! Zero-normalized cross correlation surface with two-peak search.

use crate::tracking::supersample::Patch;
use crate::tracking::TrackerError;
use rayon::prelude::*;

/// Templates with a lower intensity variance cannot be correlated.
pub const MIN_TEMPLATE_VARIANCE: f64 = 1e-10;
/// Search windows whose variance is below this fraction of their energy score 0.
const FLAT_WINDOW_FRACTION: f64 = 1e-9;

/// Summed-area table with a zero first row and column.
struct IntegralImage {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralImage {
    fn new(patch: &Patch) -> Self {
        let stride = patch.width + 1;
        let mut sum = vec![0.0; stride * (patch.height + 1)];
        let mut sum_sq = vec![0.0; stride * (patch.height + 1)];
        for y in 0..patch.height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..patch.width {
                let v = patch.get(x, y);
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        IntegralImage {
            stride,
            sum,
            sum_sq,
        }
    }

    /// Sum and sum of squares over the `w x h` window at `(x, y)`.
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let corner = |t: &[f64]| t[(y + h) * s + x + w] - t[y * s + x + w] - t[(y + h) * s + x] + t[y * s + x];
        (corner(&self.sum), corner(&self.sum_sq))
    }
}

/// Correlation score for every placement of a template inside a search patch.
#[derive(Debug, Clone)]
pub struct CorrelationSurface {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

/// Location and value of the global maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: usize,
    pub y: usize,
    pub value: f64,
}

impl CorrelationSurface {
    /// Computes the ZNCC of `template` at every placement inside `search`.
    ///
    /// Rows of the surface are evaluated in parallel.
    ///
    /// # Errors
    ///
    /// * [`TrackerError::DegenerateTemplate`] if the template is flat.
    pub fn compute(template: &Patch, search: &Patch) -> Result<Self, TrackerError> {
        let variance = template.variance();
        if !(variance >= MIN_TEMPLATE_VARIANCE) {
            return Err(TrackerError::DegenerateTemplate { variance });
        }

        let (tw, th) = (template.width, template.height);
        let n = (tw * th) as f64;
        let mean = template.mean();
        let centered: Vec<f64> = template.data.iter().map(|v| v - mean).collect();
        let template_energy = variance * n;

        let width = search.width - tw + 1;
        let height = search.height - th + 1;
        let integral = IntegralImage::new(search);

        let mut data = vec![0.0; width * height];
        data.par_chunks_mut(width).enumerate().for_each(|(oy, row)| {
            for (ox, score) in row.iter_mut().enumerate() {
                let (sum, sum_sq) = integral.window(ox, oy, tw, th);
                let window_energy = sum_sq - sum * sum / n;
                if window_energy <= FLAT_WINDOW_FRACTION * sum_sq {
                    *score = 0.0;
                    continue;
                }

                let mut cross = 0.0;
                for ty in 0..th {
                    let start = (oy + ty) * search.width + ox;
                    let search_row = &search.data[start..start + tw];
                    let template_row = &centered[ty * tw..(ty + 1) * tw];
                    cross += template_row
                        .iter()
                        .zip(search_row)
                        .map(|(t, s)| t * s)
                        .sum::<f64>();
                }
                *score = (cross / (window_energy * template_energy).sqrt()).clamp(-1.0, 1.0);
            }
        });

        Ok(CorrelationSurface {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Global maximum; the first one in row-major order on ties.
    pub fn peak(&self) -> Peak {
        let mut best = Peak {
            x: 0,
            y: 0,
            value: f64::NEG_INFINITY,
        };
        for (i, &value) in self.data.iter().enumerate() {
            if value > best.value {
                best = Peak {
                    x: i % self.width,
                    y: i / self.width,
                    value,
                };
            }
        }
        best
    }

    /// Sub-sample offset of a peak from a parabola through it and its two
    /// neighbours along each axis, clamped to `[-0.5, 0.5]`.
    pub fn refine(&self, peak: &Peak) -> (f64, f64) {
        let vertex = |left: f64, centre: f64, right: f64| {
            let curvature = left - 2.0 * centre + right;
            if curvature < 0.0 {
                (0.5 * (left - right) / curvature).clamp(-0.5, 0.5)
            } else {
                0.0
            }
        };
        let dx = if peak.x > 0 && peak.x + 1 < self.width {
            vertex(self.get(peak.x - 1, peak.y), peak.value, self.get(peak.x + 1, peak.y))
        } else {
            0.0
        };
        let dy = if peak.y > 0 && peak.y + 1 < self.height {
            vertex(self.get(peak.x, peak.y - 1), peak.value, self.get(peak.x, peak.y + 1))
        } else {
            0.0
        };
        (dx, dy)
    }

    /// Maximum over placements farther than `radius` samples from `peak`;
    /// 0 when none qualify.
    pub fn secondary_peak(&self, peak: &Peak, radius: f64) -> f64 {
        let r2 = radius * radius;
        let mut best: Option<f64> = None;
        for y in 0..self.height {
            let dy = y as f64 - peak.y as f64;
            for x in 0..self.width {
                let dx = x as f64 - peak.x as f64;
                if dx * dx + dy * dy > r2 {
                    let value = self.get(x, y);
                    best = Some(best.map_or(value, |b| b.max(value)));
                }
            }
        }
        best.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn patch(width: usize, height: usize, f: impl Fn(usize, usize) -> f64) -> Patch {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Patch {
            width,
            height,
            data,
        }
    }

    fn texture(x: usize, y: usize) -> f64 {
        ((x * 7 + y * 13) % 11) as f64 + ((x * y) % 5) as f64
    }

    #[test]
    fn test_exact_match_scores_one() {
        let search = patch(12, 10, texture);
        let template = patch(5, 4, |x, y| 3.0 * texture(x + 4, y + 3) + 10.0);
        let surface = CorrelationSurface::compute(&template, &search).unwrap();
        assert_eq!((surface.width, surface.height), (8, 7));

        let peak = surface.peak();
        assert_eq!((peak.x, peak.y), (4, 3));
        assert_relative_eq!(peak.value, 1.0, epsilon = 1e-12);
        assert!(surface.data.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_flat_template_is_degenerate() {
        let search = patch(8, 8, texture);
        let template = patch(3, 3, |_, _| 42.0);
        assert!(matches!(
            CorrelationSurface::compute(&template, &search),
            Err(TrackerError::DegenerateTemplate { .. })
        ));
    }

    #[test]
    fn test_flat_window_scores_zero() {
        let search = patch(8, 4, |x, _| if x < 4 { 5.0 } else { texture(x, 0) });
        let template = patch(3, 3, texture);
        let surface = CorrelationSurface::compute(&template, &search).unwrap();
        assert_eq!(surface.get(0, 0), 0.0);
        assert_eq!(surface.get(1, 1), 0.0);
    }

    #[test]
    fn test_parabolic_refinement() {
        let surface = CorrelationSurface {
            width: 3,
            height: 3,
            data: vec![0.0, 0.5, 0.0, 0.6, 1.0, 0.8, 0.0, 0.9, 0.0],
        };
        let peak = surface.peak();
        let (dx, dy) = surface.refine(&peak);
        // Vertex of the parabola through (-1, 0.6), (0, 1), (1, 0.8)
        assert_relative_eq!(dx, 0.5 * (0.6 - 0.8) / (0.6 - 2.0 + 0.8), epsilon = 1e-12);
        assert_relative_eq!(dy, 0.5 * (0.5 - 0.9) / (0.5 - 2.0 + 0.9), epsilon = 1e-12);
        assert!(dx > 0.0 && dy > 0.0);
    }

    #[test]
    fn test_secondary_peak_respects_exclusion() {
        let mut data = vec![0.1; 11 * 11];
        data[5 * 11 + 5] = 1.0;
        data[5 * 11 + 6] = 0.95;
        data[5 * 11 + 9] = 0.4;
        let surface = CorrelationSurface {
            width: 11,
            height: 11,
            data,
        };
        let peak = surface.peak();
        assert_eq!(surface.secondary_peak(&peak, 3.0), 0.4);
        assert_eq!(surface.secondary_peak(&peak, 0.5), 0.95);
        assert_eq!(surface.secondary_peak(&peak, 20.0), 0.0);
    }
}
