//! Patch extraction and cubic-convolution supersampling.

use crate::tracking::TrackerError;
use crate::util::GrayImageF32;
use nalgebra::Vector2;

/// Border kept around every extracted patch so the 4-tap kernel never reads
/// outside it.
pub const PATCH_MARGIN: usize = 2;

/// Keys cubic convolution parameter.
const KEYS_A: f64 = -0.5;

/// Row-major block of intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl Patch {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    pub fn mean(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    pub fn variance(&self) -> f64 {
        let mean = self.mean();
        self.data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.data.len() as f64
    }
}

/// Copies the square of half-width `radius + margin` centred at `center`.
///
/// # Errors
///
/// * [`TrackerError::OutOfFrame`] if any sample falls outside the image.
pub fn extract_patch(
    image: &GrayImageF32,
    center: Vector2<i64>,
    radius: usize,
    margin: usize,
) -> Result<Patch, TrackerError> {
    let out_of_frame = TrackerError::OutOfFrame {
        x: center.x,
        y: center.y,
    };
    let half = (radius + margin) as i64;
    let (x0, y0, x1, y1) = match (
        center.x.checked_sub(half),
        center.y.checked_sub(half),
        center.x.checked_add(half),
        center.y.checked_add(half),
    ) {
        (Some(x0), Some(y0), Some(x1), Some(y1)) => (x0, y0, x1, y1),
        _ => return Err(out_of_frame),
    };
    if x0 < 0 || y0 < 0 || x1 >= image.width() as i64 || y1 >= image.height() as i64 {
        return Err(out_of_frame);
    }

    let size = (2 * half + 1) as usize;
    let mut data = Vec::with_capacity(size * size);
    for y in y0..=y1 {
        for x in x0..=x1 {
            data.push(image.get_pixel(x as u32, y as u32)[0] as f64);
        }
    }
    Ok(Patch {
        width: size,
        height: size,
        data,
    })
}

/// Keys cubic convolution kernel.
pub fn keys_weight(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1.0 {
        (KEYS_A + 2.0) * x.powi(3) - (KEYS_A + 3.0) * x.powi(2) + 1.0
    } else if x < 2.0 {
        KEYS_A * x.powi(3) - 5.0 * KEYS_A * x.powi(2) + 8.0 * KEYS_A * x - 4.0 * KEYS_A
    } else {
        0.0
    }
}

/// First-tap offset and the four tap weights for every output phase.
///
/// Output sample `k = q * factor + r` sits at native position
/// `q + (r + 0.5) / factor - 0.5`.
fn phase_weights(factor: usize) -> Vec<(isize, [f64; 4])> {
    (0..factor)
        .map(|r| {
            let phi = (r as f64 + 0.5) / factor as f64 - 0.5;
            let floor = phi.floor();
            let t = phi - floor;
            (
                floor as isize - 1,
                [
                    keys_weight(t + 1.0),
                    keys_weight(t),
                    keys_weight(1.0 - t),
                    keys_weight(2.0 - t),
                ],
            )
        })
        .collect()
}

/// Upsamples `patch` by `factor` and crops `margin` native samples from
/// every side.
///
/// Template and search patches upsampled with the same factor share phases,
/// so samples at integer native offsets are bit-identical.
pub fn upsample(patch: &Patch, factor: usize, margin: usize) -> Patch {
    let inner_w = patch.width - 2 * margin;
    let inner_h = patch.height - 2 * margin;
    let out_w = inner_w * factor;
    let out_h = inner_h * factor;
    let phases = phase_weights(factor);

    // Horizontal pass over every row, margin rows included.
    let mut horizontal = vec![0.0; patch.height * out_w];
    for y in 0..patch.height {
        let row = &patch.data[y * patch.width..(y + 1) * patch.width];
        for q in 0..inner_w {
            for (r, (offset, weights)) in phases.iter().enumerate() {
                let first = ((q + margin) as isize + offset) as usize;
                horizontal[y * out_w + q * factor + r] = weights
                    .iter()
                    .zip(&row[first..first + 4])
                    .map(|(w, v)| w * v)
                    .sum();
            }
        }
    }

    let mut data = vec![0.0; out_h * out_w];
    for q in 0..inner_h {
        for (r, (offset, weights)) in phases.iter().enumerate() {
            let first = ((q + margin) as isize + offset) as usize;
            let out_row = &mut data[(q * factor + r) * out_w..(q * factor + r + 1) * out_w];
            for (x, out) in out_row.iter_mut().enumerate() {
                *out = weights
                    .iter()
                    .enumerate()
                    .map(|(j, w)| w * horizontal[(first + j) * out_w + x])
                    .sum();
            }
        }
    }

    Patch {
        width: out_w,
        height: out_h,
        data,
    }
}
