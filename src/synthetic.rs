//! Synthetic particle images for demos and tests.

use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::{Normal, Uniform};

use crate::image::{apply_geometry, image_center, Affine2, ImageId, ImageRecord};
use crate::store::InMemoryImageStore;

fn radial(shape: (usize, usize), inside: impl Fn(f64) -> bool) -> Array2<f64> {
    let (cx, cy) = image_center(shape);
    Array2::from_shape_fn(shape, |(row, col)| {
        let x = col as f64 - cx;
        let y = row as f64 - cy;
        if inside((x * x + y * y).sqrt()) {
            1.0
        } else {
            0.0
        }
    })
}

/// Filled disc around the image centre.
pub fn disc(shape: (usize, usize), radius: f64) -> Array2<f64> {
    radial(shape, |r| r <= radius)
}

/// Annulus `inner <= r <= outer` around the image centre.
pub fn ring(shape: (usize, usize), inner: f64, outer: f64) -> Array2<f64> {
    radial(shape, |r| (inner..=outer).contains(&r))
}

/// Horizontal bar through the centre.
pub fn bar(shape: (usize, usize), half_length: usize, half_width: usize) -> Array2<f64> {
    let (cx, cy) = image_center(shape);
    let (cx, cy) = (cx as usize, cy as usize);
    Array2::from_shape_fn(shape, |(row, col)| {
        if row.abs_diff(cy) <= half_width && col.abs_diff(cx) <= half_length {
            1.0
        } else {
            0.0
        }
    })
}

/// `image` plus white Gaussian noise.
pub fn add_noise<R: Rng>(image: &Array2<f64>, sigma: f64, rng: &mut R) -> Array2<f64> {
    match Normal::new(0.0, sigma) {
        Ok(normal) if sigma > 0.0 => image + &Array2::random_using(image.dim(), normal, rng),
        _ => image.clone(),
    }
}

/// `count` noisy copies of `template`, each turned by a random angle and
/// moved by a random whole-pixel shift of at most `max_shift` per axis.
pub fn population<R: Rng>(
    template: &Array2<f64>,
    count: usize,
    noise: f64,
    max_shift: i32,
    rng: &mut R,
) -> Vec<Array2<f64>> {
    let angles = Uniform::new(0.0, 2.0 * std::f64::consts::PI);
    (0..count)
        .map(|_| {
            let theta = rng.sample(angles);
            let dx = rng.gen_range(-max_shift..=max_shift) as f64;
            let dy = rng.gen_range(-max_shift..=max_shift) as f64;
            let transform = Affine2::translation(dx, dy).compose(&Affine2::rotation(theta));
            add_noise(&apply_geometry(template, &transform), noise, rng)
        })
        .collect()
}

/// Store holding the images of every group in order, with ids `0..`.
pub fn store_from(groups: &[Vec<Array2<f64>>]) -> InMemoryImageStore {
    InMemoryImageStore::from_records(
        groups
            .iter()
            .flatten()
            .enumerate()
            .map(|(i, pixels)| ImageRecord::new(ImageId(i as u64), pixels.clone())),
    )
}
