//! Image primitives: identifiers, rigid geometry and the pixel operations the
//! alignment and prototype code are built on.
//!
//! Coordinates are centred: pixel `(row, col)` sits at
//! `x = col - width / 2`, `y = row - height / 2`. All resampling wraps around
//! the image borders.

use std::fmt;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

const STD_EPSILON: f64 = 1e-12;

/// Opaque handle into the external image store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One input image as read from the store.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: ImageId,
    pub pixels: Array2<f64>,
    pub weight: f64,
}

impl ImageRecord {
    pub fn new(id: ImageId, pixels: Array2<f64>) -> Self {
        Self {
            id,
            pixels,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// In-plane rigid transform parameters as stored in the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    /// In-plane rotation in degrees.
    pub psi: f64,
    pub shift_x: f64,
    pub shift_y: f64,
    /// Horizontal mirror applied before rotation and shift.
    pub flip: bool,
}

impl Geometry {
    pub fn shift_norm2(&self) -> f64 {
        self.shift_x * self.shift_x + self.shift_y * self.shift_y
    }

    /// Mirror first, then rotate, then shift.
    pub fn to_affine(&self) -> Affine2 {
        let mut affine = Affine2::rotation(self.psi.to_radians());
        if self.flip {
            affine = affine.compose(&Affine2::mirror_x());
        }
        Affine2::translation(self.shift_x, self.shift_y).compose(&affine)
    }
}

/// 2-D affine transform `p -> L p + t` in centred coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    m: [[f64; 3]; 2],
}

impl Affine2 {
    pub fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            m: [[1.0, 0.0, dx], [0.0, 1.0, dy]],
        }
    }

    /// Counter-clockwise rotation by `theta` radians about the centre.
    pub fn rotation(theta: f64) -> Self {
        let (s, c) = theta.sin_cos();
        Self {
            m: [[c, -s, 0.0], [s, c, 0.0]],
        }
    }

    /// Horizontal mirror, `x -> -x`.
    pub fn mirror_x() -> Self {
        Self {
            m: [[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    /// The transform that applies `inner` first and then `self`.
    pub fn compose(&self, inner: &Affine2) -> Affine2 {
        let a = &self.m;
        let b = &inner.m;
        let mut m = [[0.0; 3]; 2];
        for r in 0..2 {
            for c in 0..2 {
                m[r][c] = a[r][0] * b[0][c] + a[r][1] * b[1][c];
            }
            m[r][2] = a[r][0] * b[0][2] + a[r][1] * b[1][2] + a[r][2];
        }
        Affine2 { m }
    }

    pub fn determinant(&self) -> f64 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    pub fn inverse(&self) -> Option<Affine2> {
        let det = self.determinant();
        if det.abs() < STD_EPSILON {
            return None;
        }
        let [[a, b, tx], [c, d, ty]] = self.m;
        let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
        Some(Affine2 {
            m: [
                [ia, ib, -(ia * tx + ib * ty)],
                [ic, id, -(ic * tx + id * ty)],
            ],
        })
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.m[0][2],
            self.m[1][0] * x + self.m[1][1] * y + self.m[1][2],
        )
    }

    /// Decompose into mirror / rotation / shift. Only meaningful for rigid
    /// transforms.
    pub fn to_geometry(&self) -> Geometry {
        let flip = self.determinant() < 0.0;
        let [[a, _, tx], [c, _, ty]] = self.m;
        // Undo the mirror on the input side: L * diag(-1, 1) negates column 0.
        let (cos_part, sin_part) = if flip { (-a, -c) } else { (a, c) };
        Geometry {
            psi: sin_part.atan2(cos_part).to_degrees(),
            shift_x: tx,
            shift_y: ty,
            flip,
        }
    }
}

pub fn image_center(shape: (usize, usize)) -> (f64, f64) {
    ((shape.1 / 2) as f64, (shape.0 / 2) as f64)
}

/// Bilinear sample at fractional `(row, col)`, wrapping at the borders.
pub fn sample_wrapped(image: &Array2<f64>, row: f64, col: f64) -> f64 {
    let (h, w) = image.dim();
    let r0f = row.floor();
    let c0f = col.floor();
    let fy = row - r0f;
    let fx = col - c0f;
    let r0 = (r0f as isize).rem_euclid(h as isize) as usize;
    let c0 = (c0f as isize).rem_euclid(w as isize) as usize;
    let r1 = (r0 + 1) % h;
    let c1 = (c0 + 1) % w;

    let top = if fx == 0.0 {
        image[[r0, c0]]
    } else {
        (1.0 - fx) * image[[r0, c0]] + fx * image[[r0, c1]]
    };
    if fy == 0.0 {
        return top;
    }
    let bottom = if fx == 0.0 {
        image[[r1, c0]]
    } else {
        (1.0 - fx) * image[[r1, c0]] + fx * image[[r1, c1]]
    };
    (1.0 - fy) * top + fy * bottom
}

/// Resample `image` under `transform`: `out(p) = in(transform⁻¹ p)`.
///
/// Singular transforms leave the image unchanged.
pub fn apply_geometry(image: &Array2<f64>, transform: &Affine2) -> Array2<f64> {
    let Some(inverse) = transform.inverse() else {
        return image.clone();
    };
    let (cx, cy) = image_center(image.dim());
    Array2::from_shape_fn(image.dim(), |(row, col)| {
        let (sx, sy) = inverse.apply(col as f64 - cx, row as f64 - cy);
        sample_wrapped(image, sy + cy, sx + cx)
    })
}

pub fn mirror(image: &Array2<f64>) -> Array2<f64> {
    apply_geometry(image, &Affine2::mirror_x())
}

/// Shift to zero mean and unit variance. Constant images only lose their mean.
pub fn normalize(image: &Array2<f64>) -> Array2<f64> {
    let n = image.len().max(1) as f64;
    let mean = image.sum() / n;
    let var = image.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = var.sqrt();
    if std > STD_EPSILON {
        image.mapv(|v| (v - mean) / std)
    } else {
        image.mapv(|v| v - mean)
    }
}

/// Binary disc of radius `min(h, w) / 2` around the image centre.
pub fn circular_mask(shape: (usize, usize)) -> Array2<bool> {
    let (cx, cy) = image_center(shape);
    let radius = (shape.0.min(shape.1) / 2) as f64;
    let r2 = radius * radius;
    Array2::from_shape_fn(shape, |(row, col)| {
        let x = col as f64 - cx;
        let y = row as f64 - cy;
        x * x + y * y <= r2
    })
}

pub fn apply_mask(image: &mut Array2<f64>, mask: &Array2<bool>) {
    Zip::from(image).and(mask).for_each(|v, &inside| {
        if !inside {
            *v = 0.0;
        }
    });
}

/// Standard deviation of the pixels outside the mask.
pub fn noise_outside_mask(image: &Array2<f64>, mask: &Array2<bool>) -> f64 {
    let outside: Vec<f64> = image
        .iter()
        .zip(mask.iter())
        .filter(|&(_, &inside)| !inside)
        .map(|(&v, _)| v)
        .collect();
    if outside.is_empty() {
        return 0.0;
    }
    let n = outside.len() as f64;
    let mean = outside.iter().sum::<f64>() / n;
    (outside.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}

/// Move the centre of mass of the positive part of the masked image to the
/// image centre, using a whole-pixel shift, and re-apply the mask.
pub fn center_image(image: &Array2<f64>, mask: &Array2<bool>) -> Array2<f64> {
    let (cx, cy) = image_center(image.dim());
    let mut total = 0.0;
    let mut mx = 0.0;
    let mut my = 0.0;
    for ((row, col), &v) in image.indexed_iter() {
        if v > 0.0 && mask[[row, col]] {
            total += v;
            mx += v * (col as f64 - cx);
            my += v * (row as f64 - cy);
        }
    }
    if total <= 0.0 {
        return image.clone();
    }
    let dx = -(mx / total).round();
    let dy = -(my / total).round();
    if dx == 0.0 && dy == 0.0 {
        return image.clone();
    }
    let mut centered = apply_geometry(image, &Affine2::translation(dx, dy));
    apply_mask(&mut centered, mask);
    centered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asymmetric(shape: (usize, usize)) -> Array2<f64> {
        Array2::from_shape_fn(shape, |(r, c)| (r * 3 + c * 7 % 5) as f64)
    }

    #[test]
    fn geometry_survives_affine_round_trip() {
        let geometry = Geometry {
            psi: 33.0,
            shift_x: 1.5,
            shift_y: -2.0,
            flip: true,
        };
        let back = geometry.to_affine().to_geometry();
        assert!(back.flip);
        assert!((back.psi - 33.0).abs() < 1e-9);
        assert!((back.shift_x - 1.5).abs() < 1e-9);
        assert!((back.shift_y + 2.0).abs() < 1e-9);
    }

    #[test]
    fn compose_applies_inner_first() {
        let shift = Affine2::translation(2.0, 0.0);
        let quarter = Affine2::rotation(std::f64::consts::FRAC_PI_2);
        let (x, y) = quarter.compose(&shift).apply(0.0, 0.0);
        assert!(x.abs() < 1e-12);
        assert!((y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn integer_translation_is_exact() {
        let image = asymmetric((8, 8));
        let moved = apply_geometry(&image, &Affine2::translation(2.0, -1.0));
        // out(row, col) = in(row + 1, col - 2)
        assert_eq!(moved[[3, 5]], image[[4, 3]]);
        assert_eq!(moved[[7, 0]], image[[0, 6]]);
    }

    #[test]
    fn identity_and_double_mirror_preserve_pixels() {
        let image = asymmetric((6, 6));
        assert_eq!(apply_geometry(&image, &Affine2::identity()), image);
        assert_eq!(mirror(&mirror(&image)), image);
        assert_ne!(mirror(&image), image);
    }

    #[test]
    fn normalize_gives_zero_mean_unit_variance() {
        let image = asymmetric((10, 10));
        let normalized = normalize(&image);
        let n = normalized.len() as f64;
        let mean = normalized.sum() / n;
        let var = normalized.iter().map(|v| v * v).sum::<f64>() / n;
        assert!(mean.abs() < 1e-9);
        assert!((var - 1.0).abs() < 1e-9);

        let flat = normalize(&Array2::from_elem((4, 4), 3.0));
        assert!(flat.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mask_covers_inscribed_disc() {
        let mask = circular_mask((16, 16));
        assert!(mask[[8, 8]]);
        assert!(mask[[8, 0]]);
        assert!(!mask[[0, 0]]);
        assert!(!mask[[15, 15]]);
    }

    #[test]
    fn noise_is_measured_outside_mask_only() {
        let mask = circular_mask((16, 16));
        let mut image = Array2::zeros((16, 16));
        for ((r, c), v) in image.indexed_iter_mut() {
            if !mask[[r, c]] {
                *v = if (r + c) % 2 == 0 { 1.0 } else { -1.0 };
            } else {
                *v = 100.0;
            }
        }
        let noise = noise_outside_mask(&image, &mask);
        assert!((noise - 1.0).abs() < 0.05);
    }

    #[test]
    fn centering_moves_blob_to_center() {
        let mask = circular_mask((16, 16));
        let mut image = Array2::from_elem((16, 16), -0.1);
        image[[5, 10]] = 2.0;
        image[[5, 11]] = 2.0;
        let centered = center_image(&image, &mask);
        let (r, c) = centered
            .indexed_iter()
            .fold(((0, 0), f64::MIN), |best, (idx, &v)| {
                if v > best.1 {
                    (idx, v)
                } else {
                    best
                }
            })
            .0;
        assert_eq!(r, 8);
        assert!(c == 7 || c == 8);
    }
}
