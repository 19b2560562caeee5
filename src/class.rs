//! A class: committed prototype, pending accumulator and membership.

use ndarray::Array2;

use crate::align::{Aligner, Assignment, Fit, PolarImage};
use crate::histogram::{finite_range, Histogram, HISTOGRAM_BINS};
use crate::image::{apply_mask, center_image, normalize};

/// One class of the quantizer.
///
/// The committed prototype is what images are aligned against during a
/// round. Accepted images go to the pending accumulator and only become the
/// new prototype on [`Class::commit`], which also moves the pending list into
/// the membership list.
#[derive(Debug, Clone)]
pub struct Class {
    prototype: Array2<f64>,
    polar: Option<PolarImage>,
    pending: Array2<f64>,
    pending_list: Vec<Assignment>,
    members: Vec<Assignment>,
    non_member_corr: Vec<f64>,
    class_histogram: Option<Histogram>,
    non_class_histogram: Option<Histogram>,
    neighbours: Vec<usize>,
}

impl Class {
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            prototype: Array2::zeros(shape),
            polar: None,
            pending: Array2::zeros(shape),
            pending_list: Vec::new(),
            members: Vec::new(),
            non_member_corr: Vec::new(),
            class_histogram: None,
            non_class_histogram: None,
            neighbours: Vec::new(),
        }
    }

    /// A class whose prototype comes from outside the run. It can be fitted
    /// against immediately but has no members.
    pub fn seeded(prototype: &Array2<f64>, aligner: &Aligner) -> Self {
        let mut class = Self::empty(aligner.shape());
        class.install_prototype(prototype.clone(), aligner);
        class
    }

    pub fn prototype(&self) -> &Array2<f64> {
        &self.prototype
    }

    pub fn polar(&self) -> Option<&PolarImage> {
        self.polar.as_ref()
    }

    /// Committed membership.
    pub fn members(&self) -> &[Assignment] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pending(&self) -> &Array2<f64> {
        &self.pending
    }

    pub fn pending_list(&self) -> &[Assignment] {
        &self.pending_list
    }

    pub fn non_member_samples(&self) -> &[f64] {
        &self.non_member_corr
    }

    pub fn neighbours(&self) -> &[usize] {
        &self.neighbours
    }

    pub fn set_neighbours(&mut self, neighbours: Vec<usize>) {
        self.neighbours = neighbours;
    }

    /// In-class and out-of-class histograms, when both exist.
    pub fn histograms(&self) -> Option<(&Histogram, &Histogram)> {
        Some((self.class_histogram.as_ref()?, self.non_class_histogram.as_ref()?))
    }

    /// Add an aligned image to the pending prototype. Rejected unless the
    /// fit is positive and names a source image.
    pub fn accumulate(&mut self, image: &Array2<f64>, assignment: &Assignment, weight: f64) -> bool {
        if !(assignment.corr > 0.0) {
            return false;
        }
        self.admit(image, assignment, weight)
    }

    /// Make the image a pending member whatever its score. Only a positive
    /// fit adds to the pending prototype.
    pub fn admit(&mut self, image: &Array2<f64>, assignment: &Assignment, weight: f64) -> bool {
        if assignment.image.is_none() {
            return false;
        }
        if assignment.corr > 0.0 {
            self.pending.scaled_add(weight, image);
        }
        self.pending_list.push(assignment.clone());
        true
    }

    /// Score of an image that was compared with this class but went elsewhere.
    pub fn record_non_member(&mut self, corr: f64) {
        self.non_member_corr.push(corr);
    }

    /// Turn the pending state into the new prototype and membership.
    pub fn commit(&mut self, aligner: &Aligner, classic: bool) {
        if self.pending_list.is_empty() {
            self.prototype.fill(0.0);
            self.polar = None;
            self.members.clear();
            self.class_histogram = None;
            self.non_class_histogram = None;
        } else {
            let averaged = &self.pending / self.pending_list.len() as f64;
            self.install_prototype(averaged, aligner);
            self.members = std::mem::take(&mut self.pending_list);
            if classic {
                self.class_histogram = None;
                self.non_class_histogram = None;
            } else {
                self.rebuild_histograms();
            }
        }
        self.pending.fill(0.0);
        self.pending_list.clear();
        self.non_member_corr.clear();
    }

    /// Align `image` to the prototype. `None` while nothing was committed.
    pub fn fit(&self, image: &Array2<f64>, aligner: &Aligner, with_likelihood: bool) -> Option<Fit> {
        let polar = self.polar.as_ref()?;
        let mut fit = aligner.align(&self.prototype, polar, image);
        if with_likelihood {
            fit.assignment.likelihood = self.likelihood(fit.assignment.corr);
        }
        Some(fit)
    }

    /// Product of the cumulative in-class and out-of-class mass up to `corr`.
    pub fn likelihood(&self, corr: f64) -> Option<f64> {
        let (in_class, out_of_class) = self.histograms()?;
        Some(in_class.cumulative_at(corr)? * out_of_class.cumulative_at(corr)?)
    }

    /// Indices of the `k` classes whose prototypes fit this one best,
    /// this class included. Every index when `k` covers all classes.
    pub fn look_for_neighbours(
        &self,
        self_index: usize,
        classes: &[Class],
        k: usize,
        aligner: &Aligner,
    ) -> Vec<usize> {
        if k >= classes.len() {
            return (0..classes.len()).collect();
        }
        let mut scored: Vec<(usize, f64)> = classes
            .iter()
            .enumerate()
            .map(|(j, other)| {
                let score = if j == self_index {
                    1.0
                } else if other.polar.is_none() {
                    0.0
                } else {
                    self.fit(&other.prototype, aligner, false)
                        .map_or(0.0, |fit| fit.assignment.corr)
                };
                (j, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(j, _)| j).collect()
    }

    pub(crate) fn pending_mut(&mut self) -> &mut Array2<f64> {
        &mut self.pending
    }

    pub(crate) fn take_pending_list(&mut self) -> Vec<Assignment> {
        std::mem::take(&mut self.pending_list)
    }

    pub(crate) fn set_pending_list(&mut self, list: Vec<Assignment>) {
        self.pending_list = list;
    }

    pub(crate) fn take_non_member_samples(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.non_member_corr)
    }

    pub(crate) fn set_non_member_samples(&mut self, samples: Vec<f64>) {
        self.non_member_corr = samples;
    }

    fn install_prototype(&mut self, averaged: Array2<f64>, aligner: &Aligner) {
        let mut prototype = normalize(&averaged);
        apply_mask(&mut prototype, aligner.mask());
        let prototype = center_image(&prototype, aligner.mask());
        self.polar = Some(aligner.polar(&prototype));
        self.prototype = prototype;
    }

    fn rebuild_histograms(&mut self) {
        let class_corr: Vec<f64> = self.members.iter().map(|a| a.corr).collect();
        let all: Vec<f64> = class_corr
            .iter()
            .chain(self.non_member_corr.iter())
            .copied()
            .collect();
        let Some((lo, hi)) = finite_range(&all) else {
            self.class_histogram = None;
            self.non_class_histogram = None;
            return;
        };
        self.class_histogram =
            Some(Histogram::from_samples(&class_corr, lo, hi, HISTOGRAM_BINS).laplace_normalized());
        self.non_class_histogram = Some(
            Histogram::from_samples(&self.non_member_corr, lo, hi, HISTOGRAM_BINS)
                .laplace_normalized(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cl2dConfig, SimilarityMode};
    use crate::image::ImageId;

    const SHAPE: (usize, usize) = (16, 16);

    fn aligner() -> Aligner {
        let config = Cl2dConfig {
            similarity: SimilarityMode::Correlation,
            max_shift: 3.0,
            ..Default::default()
        };
        Aligner::new(SHAPE, &config)
    }

    fn bar() -> Array2<f64> {
        let mut image = Array2::zeros(SHAPE);
        for c in 4..=12 {
            for r in 7..=9 {
                image[[r, c]] = 1.0;
            }
        }
        normalize(&image)
    }

    fn disc() -> Array2<f64> {
        Array2::from_shape_fn(SHAPE, |(r, c)| {
            let (x, y) = (c as f64 - 8.0, r as f64 - 8.0);
            if x * x + y * y <= 9.0 {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn empty_commit_is_idempotent() {
        let aligner = aligner();
        let mut class = Class::seeded(&bar(), &aligner);
        class.record_non_member(0.3);
        for _ in 0..2 {
            class.commit(&aligner, false);
            assert!(class.prototype().iter().all(|&v| v == 0.0));
            assert!(class.is_empty());
            assert!(class.polar().is_none());
            assert!(class.non_member_samples().is_empty());
            assert!(class.histograms().is_none());
        }
        assert!(class.fit(&bar(), &aligner, true).is_none());
    }

    #[test]
    fn accumulate_requires_positive_fit_and_image() {
        let mut class = Class::empty(SHAPE);
        assert!(!class.accumulate(&bar(), &Assignment::for_image(ImageId(1), 0.0), 1.0));
        assert!(!class.accumulate(&bar(), &Assignment::for_image(ImageId(1), -0.4), 1.0));
        let anonymous = Assignment {
            corr: 0.9,
            ..Default::default()
        };
        assert!(!class.accumulate(&bar(), &anonymous, 1.0));
        assert!(class.accumulate(&bar(), &Assignment::for_image(ImageId(2), 0.9), 1.0));
        assert_eq!(class.pending_list().len(), 1);
    }

    #[test]
    fn admitted_images_join_without_shaping_the_prototype() {
        let aligner = aligner();
        let mut class = Class::empty(SHAPE);
        assert!(!class.admit(&bar(), &Assignment::default(), 1.0));
        assert!(class.admit(&bar(), &Assignment::for_image(ImageId(1), 0.9), 1.0));
        assert!(class.admit(&disc(), &Assignment::for_image(ImageId(2), -0.3), 1.0));
        assert!(class.admit(&disc(), &Assignment::for_image(ImageId(3), 0.0), 1.0));
        assert_eq!(class.pending_list().len(), 3);
        assert_eq!(class.pending(), &bar());

        class.commit(&aligner, true);
        assert_eq!(class.len(), 3);
        assert!(class.fit(&bar(), &aligner, false).unwrap().assignment.corr > 0.99);
    }

    #[test]
    fn commit_moves_pending_into_membership() {
        let aligner = aligner();
        let mut class = Class::empty(SHAPE);
        for id in 0..3 {
            class.accumulate(&bar(), &Assignment::for_image(ImageId(id), 0.8 + id as f64 * 0.05), 1.0);
        }
        class.record_non_member(0.1);
        class.record_non_member(0.2);
        class.commit(&aligner, false);

        assert_eq!(class.len(), 3);
        assert!(class.pending_list().is_empty());
        assert!(class.pending().iter().all(|&v| v == 0.0));
        assert!(class.non_member_samples().is_empty());
        assert!(class.polar().is_some());
        for ((r, c), &v) in class.prototype().indexed_iter() {
            if !aligner.mask()[[r, c]] {
                assert_eq!(v, 0.0);
            }
        }
        let fit = class.fit(&bar(), &aligner, false).unwrap();
        assert!(fit.assignment.corr > 0.99);
    }

    #[test]
    fn likelihood_comes_from_histograms() {
        let aligner = aligner();
        let mut class = Class::empty(SHAPE);
        for id in 0..5 {
            class.accumulate(&bar(), &Assignment::for_image(ImageId(id), 0.6 + 0.05 * id as f64), 1.0);
        }
        for corr in [0.1, 0.2, 0.3] {
            class.record_non_member(corr);
        }
        class.commit(&aligner, false);

        let (in_class, out_of_class) = class.histograms().unwrap();
        assert_eq!(in_class.min(), 0.1);
        assert_eq!(out_of_class.max(), 0.8);
        let high = class.likelihood(0.75).unwrap();
        let low = class.likelihood(0.15).unwrap();
        assert!(high > low);
        assert!(high <= 1.0);
        assert_eq!(class.likelihood(0.95), None);
        assert_eq!(class.likelihood(0.05), None);

        class.accumulate(&bar(), &Assignment::for_image(ImageId(9), 0.7), 1.0);
        class.commit(&aligner, true);
        assert!(class.histograms().is_none());
        assert_eq!(class.likelihood(0.7), None);
    }

    #[test]
    fn neighbours_rank_similar_prototypes_first() {
        let aligner = aligner();
        let classes = vec![
            Class::seeded(&bar(), &aligner),
            Class::seeded(&normalize(&disc()), &aligner),
            Class::seeded(&bar(), &aligner),
            Class::empty(SHAPE),
        ];
        assert_eq!(classes[0].look_for_neighbours(0, &classes, 4, &aligner), vec![0, 1, 2, 3]);
        let mut two = classes[0].look_for_neighbours(0, &classes, 2, &aligner);
        two.sort_unstable();
        assert_eq!(two, vec![0, 2]);
    }
}
