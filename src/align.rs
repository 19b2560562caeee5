//! Registration of one image against one class prototype.
//!
//! The heavy lifting (shift search, rotation search, polar resampling) sits
//! behind [`RegistrationKernel`]. [`Aligner`] drives a kernel through both
//! optimisation orders, with and without mirroring, and scores the results.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::config::{Cl2dConfig, SimilarityMode};
use crate::image::{
    apply_geometry, circular_mask, image_center, mirror, sample_wrapped, Affine2, Geometry,
    ImageId,
};

/// Refinement rounds per optimisation order.
pub const ALIGNMENT_ROUNDS: usize = 3;

/// Floor for the correntropy kernel width.
pub const MIN_SIGMA: f64 = 1e-6;

/// Result of aligning one image to one class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Assignment {
    /// Source image, `None` for synthetic assignments that must never be
    /// accumulated.
    pub image: Option<ImageId>,
    pub corr: f64,
    /// Histogram likelihood; `None` when not computed or out of domain.
    pub likelihood: Option<f64>,
    pub geometry: Geometry,
}

impl Assignment {
    pub fn for_image(image: ImageId, corr: f64) -> Self {
        Self {
            image: Some(image),
            corr,
            ..Default::default()
        }
    }

    /// Score used to decide whether the assignment is good enough to keep.
    pub fn ranking_score(&self, by_likelihood: bool) -> f64 {
        match (by_likelihood, self.likelihood) {
            (true, Some(likelihood)) => likelihood,
            _ => self.corr,
        }
    }

    /// Whether `self` ranks strictly above `other`.
    ///
    /// By likelihood, a defined likelihood beats an undefined one and two
    /// undefined likelihoods fall back to raw correlation.
    pub fn outranks(&self, other: &Assignment, by_likelihood: bool) -> bool {
        if !by_likelihood {
            return self.corr > other.corr;
        }
        match (self.likelihood, other.likelihood) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.corr > other.corr,
        }
    }
}

/// Rings × angles resampling of an image around its centre. Each ring has
/// its mean removed.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarImage {
    samples: Array2<f64>,
    radii: Vec<f64>,
}

impl PolarImage {
    pub fn new(samples: Array2<f64>, radii: Vec<f64>) -> Self {
        Self { samples, radii }
    }

    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    pub fn radii(&self) -> &[f64] {
        &self.radii
    }

    pub fn n_angles(&self) -> usize {
        self.samples.ncols()
    }
}

/// Numerical core of the registration.
///
/// Conventions: a shift `t` moves content so that `out(p) = in(p - t)`; a
/// rotation `θ` turns content counter-clockwise about the image centre.
pub trait RegistrationKernel: Send + Sync {
    /// Representation of a prototype used as the rotation-search target.
    fn polar(&self, image: &Array2<f64>) -> PolarImage;

    /// Integer shift with `|t| <= radius` that best matches `image` to
    /// `reference`. Zero shift wins ties.
    fn best_shift(&self, reference: &Array2<f64>, image: &Array2<f64>, radius: usize) -> (f64, f64);

    /// Rotation in radians, in `(-π, π]`, that best matches `image` to the
    /// reference. Zero wins ties.
    fn best_rotation(&self, reference: &PolarImage, image: &Array2<f64>) -> f64;
}

/// Direct spatial-domain kernel: exhaustive circular cross-correlation over
/// shifts, and over angles of a bilinear polar resampling.
#[derive(Debug, Clone)]
pub struct SpatialKernel {
    radii: Vec<f64>,
    n_angles: usize,
}

impl SpatialKernel {
    pub fn new(shape: (usize, usize)) -> Self {
        let min_dim = shape.0.min(shape.1);
        let r_min = (min_dim / 5).max(1);
        let r_max = (min_dim / 2).saturating_sub(1).max(r_min);
        let mut n_angles = ((2.0 * std::f64::consts::PI * r_max as f64).ceil() as usize).max(8);
        if n_angles % 2 == 1 {
            n_angles += 1;
        }
        Self {
            radii: (r_min..=r_max).map(|r| r as f64).collect(),
            n_angles,
        }
    }
}

impl RegistrationKernel for SpatialKernel {
    fn polar(&self, image: &Array2<f64>) -> PolarImage {
        let (cx, cy) = image_center(image.dim());
        let step = 2.0 * std::f64::consts::PI / self.n_angles as f64;
        let mut samples = Array2::zeros((self.radii.len(), self.n_angles));
        for (ring, &radius) in self.radii.iter().enumerate() {
            let mut row = samples.row_mut(ring);
            for (k, value) in row.iter_mut().enumerate() {
                let (sin, cos) = (k as f64 * step).sin_cos();
                *value = sample_wrapped(image, cy + radius * sin, cx + radius * cos);
            }
            let mean = row.sum() / self.n_angles as f64;
            row.mapv_inplace(|v| v - mean);
        }
        PolarImage::new(samples, self.radii.clone())
    }

    fn best_shift(&self, reference: &Array2<f64>, image: &Array2<f64>, radius: usize) -> (f64, f64) {
        let (h, w) = reference.dim();
        let support: Vec<(isize, isize, f64)> = reference
            .indexed_iter()
            .filter(|&(_, &v)| v != 0.0)
            .map(|((r, c), &v)| (r as isize, c as isize, v))
            .collect();
        let score = |dx: isize, dy: isize| -> f64 {
            support
                .iter()
                .map(|&(r, c, v)| {
                    let sr = (r - dy).rem_euclid(h as isize) as usize;
                    let sc = (c - dx).rem_euclid(w as isize) as usize;
                    v * image[[sr, sc]]
                })
                .sum()
        };

        let r = radius as isize;
        let mut best = (0isize, 0isize);
        let mut best_score = score(0, 0);
        for dy in -r..=r {
            for dx in -r..=r {
                if (dx == 0 && dy == 0) || dx * dx + dy * dy > r * r {
                    continue;
                }
                let s = score(dx, dy);
                if s > best_score {
                    best_score = s;
                    best = (dx, dy);
                }
            }
        }
        (best.0 as f64, best.1 as f64)
    }

    fn best_rotation(&self, reference: &PolarImage, image: &Array2<f64>) -> f64 {
        let polar = self.polar(image);
        let n = polar.n_angles();
        if reference.samples().dim() != polar.samples().dim() {
            return 0.0;
        }
        let mut best_step = 0;
        let mut best_score = f64::NEG_INFINITY;
        for s in 0..n {
            let mut score = 0.0;
            for ((ref_ring, img_ring), &radius) in reference
                .samples()
                .rows()
                .into_iter()
                .zip(polar.samples().rows())
                .zip(reference.radii())
            {
                let ring: f64 = (0..n)
                    .map(|k| ref_ring[k] * img_ring[(k + n - s) % n])
                    .sum();
                score += radius * ring;
            }
            if score > best_score {
                best_score = score;
                best_step = s;
            }
        }
        let mut theta = 2.0 * std::f64::consts::PI * best_step as f64 / n as f64;
        if theta > std::f64::consts::PI {
            theta -= 2.0 * std::f64::consts::PI;
        }
        theta
    }
}

/// Which of the two optimisation orders produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentOrder {
    RotateThenShift,
    ShiftThenRotate,
}

/// Best alignment of an image to a prototype, with the resampled image.
#[derive(Debug, Clone)]
pub struct Fit {
    pub assignment: Assignment,
    pub order: AlignmentOrder,
    pub aligned: Array2<f64>,
}

/// Alignment and scoring engine shared by every class of a run.
pub struct Aligner {
    kernel: Box<dyn RegistrationKernel>,
    mask: Array2<bool>,
    mode: SimilarityMode,
    sigma: f64,
    max_shift2: f64,
    shift_radius: usize,
}

impl Aligner {
    pub fn new(shape: (usize, usize), config: &Cl2dConfig) -> Self {
        Self::with_kernel(shape, config, Box::new(SpatialKernel::new(shape)))
    }

    pub fn with_kernel(
        shape: (usize, usize),
        config: &Cl2dConfig,
        kernel: Box<dyn RegistrationKernel>,
    ) -> Self {
        let min_dim = shape.0.min(shape.1);
        let shift_radius = (config.max_shift.ceil() as usize).min(min_dim / 2);
        Self {
            kernel,
            mask: circular_mask(shape),
            mode: config.similarity,
            sigma: 1.0,
            max_shift2: config.max_shift2(),
            shift_radius,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn mode(&self) -> SimilarityMode {
        self.mode
    }

    /// Switch the scoring mode, returning the previous one.
    pub fn set_mode(&mut self, mode: SimilarityMode) -> SimilarityMode {
        std::mem::replace(&mut self.mode, mode)
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn set_sigma(&mut self, sigma: f64) {
        self.sigma = if sigma.is_finite() { sigma.max(MIN_SIGMA) } else { MIN_SIGMA };
    }

    pub fn polar(&self, image: &Array2<f64>) -> PolarImage {
        self.kernel.polar(image)
    }

    /// Masked similarity between a prototype and an aligned image.
    pub fn similarity(&self, reference: &Array2<f64>, image: &Array2<f64>) -> f64 {
        match self.mode {
            SimilarityMode::Correlation => {
                let (mut cross, mut ref_norm, mut img_norm) = (0.0, 0.0, 0.0);
                Zip::from(reference)
                    .and(image)
                    .and(&self.mask)
                    .for_each(|&p, &i, &inside| {
                        if inside {
                            cross += p * i;
                            ref_norm += p * p;
                            img_norm += i * i;
                        }
                    });
                if ref_norm <= 0.0 || img_norm <= 0.0 {
                    0.0
                } else {
                    cross / (ref_norm * img_norm).sqrt()
                }
            }
            SimilarityMode::Correntropy => {
                let denominator = 2.0 * self.sigma * self.sigma;
                let (mut sum, mut count) = (0.0, 0usize);
                Zip::from(reference)
                    .and(image)
                    .and(&self.mask)
                    .for_each(|&p, &i, &inside| {
                        if inside {
                            let diff = p - i;
                            sum += (-diff * diff / denominator).exp();
                            count += 1;
                        }
                    });
                if count == 0 {
                    0.0
                } else {
                    sum / count as f64
                }
            }
        }
    }

    /// Best of the four candidates: {rotate-then-shift, shift-then-rotate}
    /// × {direct, mirrored}, ranked by score with ties kept in that order.
    /// Candidates shifted beyond the limit score zero.
    pub fn align(&self, reference: &Array2<f64>, polar: &PolarImage, image: &Array2<f64>) -> Fit {
        let mut best: Option<Fit> = None;
        for mirrored in [false, true] {
            let input = if mirrored { mirror(image) } else { image.clone() };
            for (order, transform, aligned) in self.align_orders(reference, polar, &input) {
                let transform = if mirrored {
                    transform.compose(&Affine2::mirror_x())
                } else {
                    transform
                };
                let geometry = transform.to_geometry();
                let mut corr = self.similarity(reference, &aligned);
                if !corr.is_finite() || geometry.shift_norm2() > self.max_shift2 {
                    corr = 0.0;
                }
                if best.as_ref().map_or(true, |b| corr > b.assignment.corr) {
                    best = Some(Fit {
                        assignment: Assignment {
                            image: None,
                            corr,
                            likelihood: None,
                            geometry,
                        },
                        order,
                        aligned,
                    });
                }
            }
        }
        best.unwrap_or_else(|| Fit {
            assignment: Assignment::default(),
            order: AlignmentOrder::RotateThenShift,
            aligned: image.clone(),
        })
    }

    fn align_orders(
        &self,
        reference: &Array2<f64>,
        polar: &PolarImage,
        input: &Array2<f64>,
    ) -> [(AlignmentOrder, Affine2, Array2<f64>); 2] {
        let mut shift_rotate = Affine2::identity();
        let mut aligned_sr = input.clone();
        let mut rotate_shift = Affine2::identity();
        let mut aligned_rs = input.clone();

        for _ in 0..ALIGNMENT_ROUNDS {
            let (dx, dy) = self.kernel.best_shift(reference, &aligned_sr, self.shift_radius);
            if dx != 0.0 || dy != 0.0 {
                shift_rotate = Affine2::translation(dx, dy).compose(&shift_rotate);
                aligned_sr = apply_geometry(input, &shift_rotate);
            }
            let theta = self.kernel.best_rotation(polar, &aligned_sr);
            if theta != 0.0 {
                shift_rotate = Affine2::rotation(theta).compose(&shift_rotate);
                aligned_sr = apply_geometry(input, &shift_rotate);
            }

            let theta = self.kernel.best_rotation(polar, &aligned_rs);
            if theta != 0.0 {
                rotate_shift = Affine2::rotation(theta).compose(&rotate_shift);
                aligned_rs = apply_geometry(input, &rotate_shift);
            }
            let (dx, dy) = self.kernel.best_shift(reference, &aligned_rs, self.shift_radius);
            if dx != 0.0 || dy != 0.0 {
                rotate_shift = Affine2::translation(dx, dy).compose(&rotate_shift);
                aligned_rs = apply_geometry(input, &rotate_shift);
            }
        }

        [
            (AlignmentOrder::RotateThenShift, rotate_shift, aligned_rs),
            (AlignmentOrder::ShiftThenRotate, shift_rotate, aligned_sr),
        ]
    }
}
