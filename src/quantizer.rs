//! The vector quantizer: initialization, assignment rounds and the
//! degenerate-class sweep of one level.

use std::cmp::Reverse;
use std::collections::HashMap;

use ndarray::Array2;
use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::align::{Assignment, Fit};
use crate::class::Class;
use crate::comm::{Communicator, ReduceOp};
use crate::config::SimilarityMode;
use crate::context::RunContext;
use crate::error::{Cl2dError, Cl2dResult};
use crate::image::{noise_outside_mask, ImageId};
use crate::output::{ClassSummary, IterationReport, LevelReport};
use crate::split::{split_node, SplitChild, SplitOutcome};

/// Fraction of the images below which a level counts as converged.
const CONVERGENCE_FRACTION: f64 = 0.005;

/// Classes plus the image-to-class table.
#[derive(Debug, Clone)]
pub struct Quantizer {
    classes: Vec<Class>,
    ids: Vec<ImageId>,
    index: HashMap<ImageId, usize>,
    assignment: Vec<i64>,
}

impl Quantizer {
    pub fn new(ids: Vec<ImageId>, classes: Vec<Class>) -> Self {
        let index = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        Self {
            assignment: vec![-1; ids.len()],
            classes,
            ids,
            index,
        }
    }

    /// Build the starting classes.
    ///
    /// Without prototypes, image `i` goes to class `i mod Q`. With
    /// prototypes, every image goes to its best positive correlation fit.
    /// The same pass measures the noise level that sets the correntropy
    /// kernel width. Unless ranking is classic, a second pass fills the
    /// score histograms of every class.
    pub fn initialize<C: Communicator>(
        ctx: &mut RunContext<'_, C>,
        prototypes: Option<&[Array2<f64>]>,
    ) -> Cl2dResult<Self> {
        let shape = ctx.shape();
        let prototypes = prototypes.filter(|p| !p.is_empty());
        let classes: Vec<Class> = match prototypes {
            Some(prototypes) => {
                if let Some(bad) = prototypes.iter().find(|p| p.dim() != shape) {
                    return Err(Cl2dError::Validation(format!(
                        "prototype shape {:?} does not match image shape {shape:?}",
                        bad.dim()
                    )));
                }
                prototypes
                    .iter()
                    .map(|p| Class::seeded(p, &ctx.aligner))
                    .collect()
            }
            None => (0..ctx.config.initial_classes)
                .map(|_| Class::empty(shape))
                .collect(),
        };
        let n_classes = classes.len();
        let mut quantizer = Self::new(ctx.ids.clone(), classes);
        if ctx.comm.is_root() {
            info!(
                images = quantizer.ids.len(),
                classes = n_classes,
                seeded = prototypes.is_some(),
                "initializing"
            );
        }

        // The kernel width is unknown until the noise has been measured.
        let configured_mode = ctx.aligner.set_mode(SimilarityMode::Correlation);
        let mut noise = 0.0;
        ctx.distributor.reset(ctx.comm);
        while let Some((first, last)) = ctx.distributor.next_range(ctx.comm) {
            for idx in first..=last {
                let id = quantizer.ids[idx];
                let image = ctx.read_image(id, true)?;
                noise += noise_outside_mask(&image, ctx.aligner.mask());
                let weight = ctx.store.weight(id);
                if prototypes.is_some() {
                    let best = quantizer
                        .fit_all(&image, &(0..n_classes).collect::<Vec<_>>(), ctx, false)
                        .into_iter()
                        .fold(None, |best: Option<(usize, Fit)>, (q, fit)| {
                            let floor = best.as_ref().map_or(0.0, |(_, b)| b.assignment.corr);
                            if fit.assignment.corr > floor {
                                Some((q, fit))
                            } else {
                                best
                            }
                        });
                    if let Some((q, fit)) = best {
                        let mut assignment = fit.assignment;
                        assignment.image = Some(id);
                        quantizer.classes[q].accumulate(&fit.aligned, &assignment, weight);
                        quantizer.assignment[idx] = q as i64;
                    }
                } else {
                    let q = idx % n_classes;
                    quantizer.classes[q].accumulate(&image, &Assignment::for_image(id, 1.0), weight);
                    quantizer.assignment[idx] = q as i64;
                }
            }
        }
        ctx.aligner.set_mode(configured_mode);

        let mut noise = [noise];
        ctx.comm.reduce_and_combine(&mut noise, ReduceOp::Sum)?;
        ctx.aligner
            .set_sigma(noise[0] * std::f64::consts::SQRT_2 / quantizer.ids.len() as f64);

        let classic = ctx.classic(n_classes);
        quantizer.share_and_commit(ctx, classic, 0, 0)?;
        if !classic {
            quantizer.fill_histograms(ctx)?;
        }
        if ctx.comm.is_root() {
            info!(
                sigma = ctx.aligner.sigma(),
                class_sizes = ?quantizer.class_sizes(),
                "initialized"
            );
        }
        Ok(quantizer)
    }

    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn ids(&self) -> &[ImageId] {
        &self.ids
    }

    /// Class index per image, `-1` when unassigned.
    pub fn assignment(&self) -> &[i64] {
        &self.assignment
    }

    pub fn class_of(&self, id: ImageId) -> Option<usize> {
        let idx = *self.index.get(&id)?;
        usize::try_from(self.assignment[idx]).ok()
    }

    pub fn class_sizes(&self) -> Vec<usize> {
        self.classes.iter().map(Class::len).collect()
    }

    pub fn summaries(&self) -> Vec<ClassSummary> {
        self.classes
            .iter()
            .enumerate()
            .map(|(index, class)| ClassSummary::of(index, class))
            .collect()
    }

    /// Iterate assignment rounds until convergence, then sort the classes by
    /// population.
    pub fn run_level<C: Communicator>(
        &mut self,
        ctx: &mut RunContext<'_, C>,
        level: usize,
    ) -> Cl2dResult<LevelReport> {
        let n = self.ids.len() as f64;
        if ctx.comm.is_root() {
            info!(level, classes = self.classes.len(), "quantizing");
        }
        let mut iterations = Vec::new();
        let mut iteration = 1;
        loop {
            let report = self.run_round(ctx, level, iteration)?;
            let q = self.classes.len();
            if q > 1 {
                self.sweep_degenerate_classes(ctx)?;
            }
            let converged = (iteration > 1 && (report.changes as f64) < CONVERGENCE_FRACTION * n && q > 1)
                || iteration >= ctx.config.max_iterations;
            iterations.push(report);
            let quantizer = &*self;
            ctx.notify(|observer| {
                observer.level_progress(&LevelReport {
                    level,
                    iterations: iterations.clone(),
                    classes: quantizer.summaries(),
                })
            });
            if converged {
                break;
            }
            iteration += 1;
        }
        self.sort_by_population();
        self.rebuild_assignment_table();

        let report = LevelReport {
            level,
            iterations,
            classes: self.summaries(),
        };
        ctx.notify(|observer| observer.level_completed(&report));
        Ok(report)
    }

    fn run_round<C: Communicator>(
        &mut self,
        ctx: &mut RunContext<'_, C>,
        level: usize,
        iteration: usize,
    ) -> Cl2dResult<IterationReport> {
        let n = self.ids.len();
        let q = self.classes.len();
        let classic = ctx.classic(q);
        let k = ctx.config.neighbours.map_or(q, |extra| (extra + 1).min(q));

        let aligner = &ctx.aligner;
        let classes = &self.classes;
        let neighbours: Vec<Vec<usize>> = (0..q)
            .into_par_iter()
            .map(|i| classes[i].look_for_neighbours(i, classes, k, aligner))
            .collect();
        for (class, list) in self.classes.iter_mut().zip(neighbours) {
            class.set_neighbours(list);
        }

        let sizes = self.class_sizes();
        let previous = std::mem::replace(&mut self.assignment, vec![-1; n]);
        let mut corr_sum = 0.0;
        ctx.distributor.reset(ctx.comm);
        while let Some((first, last)) = ctx.distributor.next_range(ctx.comm) {
            for idx in first..=last {
                corr_sum += self.look_node(ctx, idx, previous[idx], &sizes, classic)?;
            }
        }
        let mut corr_sum = [corr_sum];
        ctx.comm.reduce_and_combine(&mut corr_sum, ReduceOp::Sum)?;
        self.share_and_commit(ctx, classic, level, iteration)?;

        let changes = if iteration > 1 {
            previous
                .iter()
                .zip(&self.assignment)
                .filter(|(old, new)| old != new)
                .count()
        } else {
            0
        };
        let report = IterationReport {
            level,
            iteration,
            classes: q,
            average_similarity: corr_sum[0] / n as f64,
            changes,
            class_sizes: self.class_sizes(),
        };
        if ctx.comm.is_root() {
            info!(
                level,
                iteration,
                average_similarity = report.average_similarity,
                changes,
                "round completed"
            );
        }
        ctx.notify(|observer| observer.iteration_completed(&report));
        Ok(report)
    }

    /// Compare one image with the candidate classes and hand it to the best
    /// one. Returns the winning score, 0 when nothing was eligible.
    fn look_node<C: Communicator>(
        &mut self,
        ctx: &mut RunContext<'_, C>,
        idx: usize,
        previous: i64,
        sizes: &[usize],
        classic: bool,
    ) -> Cl2dResult<f64> {
        let id = self.ids[idx];
        let image = ctx.read_image(id, false)?;
        let q = self.classes.len();
        let candidates: Vec<usize> = match usize::try_from(previous).ok().filter(|&p| p < q) {
            Some(prev) => {
                let explore = ctx.config.exploration_probability(sizes[prev]);
                let neighbours = self.classes[prev].neighbours();
                let rng = &mut ctx.rng;
                (0..q)
                    .filter(|j| neighbours.contains(j) || rng.gen::<f64>() < explore)
                    .collect()
            }
            None => (0..q).collect(),
        };

        let by_likelihood = !classic;
        let fits = self.fit_all(&image, &candidates, ctx, by_likelihood);
        let mut best: Option<usize> = None;
        for (pos, (_, fit)) in fits.iter().enumerate() {
            let candidate = &fit.assignment;
            if !(candidate.ranking_score(by_likelihood) > 0.0) && !ctx.config.classify_all_images {
                continue;
            }
            if best.map_or(true, |b| candidate.outranks(&fits[b].1.assignment, by_likelihood)) {
                best = Some(pos);
            }
        }
        let Some(best) = best else {
            return Ok(0.0);
        };

        let (winner, fit) = &fits[best];
        let mut assignment = fit.assignment.clone();
        assignment.image = Some(id);
        let weight = ctx.store.weight(id);
        let accepted = if ctx.config.classify_all_images {
            self.classes[*winner].admit(&fit.aligned, &assignment, weight)
        } else {
            self.classes[*winner].accumulate(&fit.aligned, &assignment, weight)
        };
        if !accepted {
            return Ok(0.0);
        }
        self.assignment[idx] = *winner as i64;
        if by_likelihood {
            for (j, other) in &fits {
                if j != winner && other.assignment.corr > 0.0 {
                    self.classes[*j].record_non_member(other.assignment.corr);
                }
            }
        }
        Ok(assignment.corr)
    }

    /// Fits of `image` against the given classes, in parallel. Classes with
    /// nothing committed are skipped.
    fn fit_all<C: Communicator>(
        &self,
        image: &Array2<f64>,
        candidates: &[usize],
        ctx: &RunContext<'_, C>,
        with_likelihood: bool,
    ) -> Vec<(usize, Fit)> {
        let aligner = &ctx.aligner;
        candidates
            .par_iter()
            .filter_map(|&q| {
                self.classes[q]
                    .fit(image, aligner, with_likelihood)
                    .map(|fit| (q, fit))
            })
            .collect()
    }

    /// Second initialization pass: every assigned image is scored against
    /// its own class and against all the others.
    fn fill_histograms<C: Communicator>(&mut self, ctx: &mut RunContext<'_, C>) -> Cl2dResult<()> {
        let all: Vec<usize> = (0..self.classes.len()).collect();
        ctx.distributor.reset(ctx.comm);
        while let Some((first, last)) = ctx.distributor.next_range(ctx.comm) {
            for idx in first..=last {
                let Ok(own) = usize::try_from(self.assignment[idx]) else {
                    continue;
                };
                let id = self.ids[idx];
                let image = ctx.read_image(id, false)?;
                for (q, fit) in self.fit_all(&image, &all, ctx, false) {
                    if q == own {
                        let mut assignment = fit.assignment;
                        assignment.image = Some(id);
                        self.classes[q].accumulate(&fit.aligned, &assignment, ctx.store.weight(id));
                    } else {
                        self.classes[q].record_non_member(fit.assignment.corr);
                    }
                }
            }
        }
        self.share_and_commit(ctx, false, 0, 0)
    }

    fn share_and_commit<C: Communicator>(
        &mut self,
        ctx: &mut RunContext<'_, C>,
        classic: bool,
        level: usize,
        iteration: usize,
    ) -> Cl2dResult<()> {
        share_updates(ctx.comm, &mut self.assignment, self.classes.iter_mut())?;
        for (index, class) in self.classes.iter_mut().enumerate() {
            class.commit(&ctx.aligner, classic);
            let class = &*class;
            ctx.notify(|observer| observer.class_committed(level, iteration, index, class));
        }
        Ok(())
    }

    /// Replace classes that are too small by a split of the largest one.
    fn sweep_degenerate_classes<C: Communicator>(&mut self, ctx: &mut RunContext<'_, C>) -> Cl2dResult<()> {
        let q = self.classes.len();
        let min_size = ctx.config.min_size_percent / 100.0 * self.ids.len() as f64 / q as f64;
        for _ in 0..q {
            let (mut smallest, mut largest) = (0, 0);
            for (i, class) in self.classes.iter().enumerate() {
                if class.len() < self.classes[smallest].len() {
                    smallest = i;
                }
                if class.len() > self.classes[largest].len() {
                    largest = i;
                }
            }
            let small = self.classes[smallest].len();
            let large = self.classes[largest].len();
            if large == 0 {
                return Err(Cl2dError::Unclassifiable(format!(
                    "all {q} classes are empty, the images are too noisy for the similarity in use"
                )));
            }
            if !((small as f64) < min_size && (small as f64) < 0.25 * large as f64) {
                break;
            }
            if ctx.comm.is_root() {
                warn!(
                    smallest,
                    size = small,
                    largest,
                    largest_size = large,
                    "replacing undersized class with a split of the largest class"
                );
            }

            for member in self.classes[smallest]
                .members()
                .iter()
                .chain(self.classes[largest].members())
            {
                if let Some(&idx) = member.image.and_then(|id| self.index.get(&id)) {
                    self.assignment[idx] = -1;
                }
            }
            let outcome = split_node(ctx, &self.classes[largest])?;
            self.install_split(largest, smallest, outcome);
        }
        Ok(())
    }

    fn install_split(&mut self, first_slot: usize, second_slot: usize, outcome: SplitOutcome) {
        for (id, child) in &outcome.reassignment {
            if let Some(&idx) = self.index.get(id) {
                self.assignment[idx] = match child {
                    SplitChild::First => first_slot,
                    SplitChild::Second => second_slot,
                } as i64;
            }
        }
        self.classes[first_slot] = outcome.first;
        self.classes[second_slot] = outcome.second;
    }

    /// Remove the class at `index` and append the two children of its split.
    pub(crate) fn replace_with_split(&mut self, index: usize, outcome: SplitOutcome) {
        self.classes.remove(index);
        self.classes.push(outcome.first);
        self.classes.push(outcome.second);
        self.rebuild_assignment_table();
    }

    /// Drop classes without members. Returns how many were removed.
    pub fn clean_empty_classes(&mut self) -> usize {
        let before = self.classes.len();
        let mut remap = vec![-1i64; before];
        let mut kept = 0;
        for (old, class) in self.classes.iter().enumerate() {
            if !class.is_empty() {
                remap[old] = kept;
                kept += 1;
            }
        }
        self.classes.retain(|class| !class.is_empty());
        self.remap_table(&remap);
        let removed = before - self.classes.len();
        if removed > 0 {
            warn!(removed, "removed empty classes");
        }
        removed
    }

    /// Stable sort by descending membership.
    pub fn sort_by_population(&mut self) {
        let mut indexed: Vec<(usize, Class)> = std::mem::take(&mut self.classes).into_iter().enumerate().collect();
        indexed.sort_by_key(|(_, class)| Reverse(class.len()));
        let mut remap = vec![-1i64; indexed.len()];
        for (new, (old, _)) in indexed.iter().enumerate() {
            remap[*old] = new as i64;
        }
        self.classes = indexed.into_iter().map(|(_, class)| class).collect();
        self.remap_table(&remap);
    }

    /// Derive the table from the committed memberships.
    pub fn rebuild_assignment_table(&mut self) {
        self.assignment.iter_mut().for_each(|a| *a = -1);
        for (q, class) in self.classes.iter().enumerate() {
            for member in class.members() {
                if let Some(&idx) = member.image.and_then(|id| self.index.get(&id)) {
                    self.assignment[idx] = q as i64;
                }
            }
        }
    }

    fn remap_table(&mut self, remap: &[i64]) {
        for a in self.assignment.iter_mut() {
            *a = usize::try_from(*a)
                .ok()
                .and_then(|old| remap.get(old).copied())
                .unwrap_or(-1);
        }
    }
}

/// Merge the per-worker partial state of a pass: table entries by maximum,
/// accumulators by sum, pending and non-member lists by concatenation.
pub(crate) fn share_updates<'c, C: Communicator>(
    comm: &C,
    table: &mut [i64],
    classes: impl IntoIterator<Item = &'c mut Class>,
) -> Cl2dResult<()> {
    comm.reduce_and_combine(table, ReduceOp::Max)?;
    for class in classes {
        comm.reduce_array(class.pending_mut(), ReduceOp::Sum)?;
        let pending = comm.gather_variable_length(class.take_pending_list())?;
        class.set_pending_list(pending);
        let samples = comm.gather_variable_length(class.take_non_member_samples())?;
        class.set_non_member_samples(samples);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::Aligner;
    use crate::comm::SoloCommunicator;
    use crate::config::Cl2dConfig;
    use crate::output::NullObserver;
    use crate::synthetic;

    const SHAPE: (usize, usize) = (16, 16);

    /// Classes with the given member ids, all scored 0.9.
    fn quantizer_with(groups: &[&[u64]], n_images: u64) -> Quantizer {
        let aligner = Aligner::new(SHAPE, &Cl2dConfig::default());
        let image = synthetic::disc(SHAPE, 3.0);
        let classes = groups
            .iter()
            .map(|ids| {
                let mut class = Class::empty(SHAPE);
                for &id in ids.iter() {
                    class.accumulate(&image, &Assignment::for_image(ImageId(id), 0.9), 1.0);
                }
                class.commit(&aligner, true);
                class
            })
            .collect();
        let mut quantizer = Quantizer::new((0..n_images).map(ImageId).collect(), classes);
        quantizer.rebuild_assignment_table();
        quantizer
    }

    #[test]
    fn table_follows_memberships() {
        let quantizer = quantizer_with(&[&[0, 2], &[1]], 4);
        assert_eq!(quantizer.assignment(), &[0, 1, 0, -1]);
        assert_eq!(quantizer.class_of(ImageId(1)), Some(1));
        assert_eq!(quantizer.class_of(ImageId(3)), None);
        assert_eq!(quantizer.class_of(ImageId(42)), None);
    }

    #[test]
    fn sorting_remaps_the_table() {
        let mut quantizer = quantizer_with(&[&[0], &[1, 2, 3], &[4, 5]], 6);
        quantizer.sort_by_population();
        assert_eq!(quantizer.class_sizes(), vec![3, 2, 1]);
        assert_eq!(quantizer.assignment(), &[2, 0, 0, 0, 1, 1]);
        for (q, class) in quantizer.classes().iter().enumerate() {
            for member in class.members() {
                assert_eq!(quantizer.class_of(member.image.unwrap()), Some(q));
            }
        }
    }

    #[test]
    fn cleaning_drops_empty_classes() {
        let mut quantizer = quantizer_with(&[&[], &[0, 1], &[], &[2]], 3);
        assert_eq!(quantizer.clean_empty_classes(), 2);
        assert_eq!(quantizer.len(), 2);
        assert_eq!(quantizer.assignment(), &[0, 0, 1]);
        assert_eq!(quantizer.clean_empty_classes(), 0);
    }

    #[test]
    fn every_table_entry_is_a_valid_class() {
        let mut quantizer = quantizer_with(&[&[0, 1], &[2], &[]], 5);
        quantizer.clean_empty_classes();
        quantizer.sort_by_population();
        let q = quantizer.len() as i64;
        assert!(quantizer.assignment().iter().all(|&a| a == -1 || (0..q).contains(&a)));
    }

    fn correlation_config() -> Cl2dConfig {
        Cl2dConfig {
            similarity: SimilarityMode::Correlation,
            max_shift: 3.0,
            ..Default::default()
        }
    }

    #[test]
    fn table_entry_matches_the_pending_membership() {
        for classify_all_images in [false, true] {
            let store = synthetic::store_from(&[vec![Array2::zeros(SHAPE)]]);
            let config = Cl2dConfig {
                classify_all_images,
                ..correlation_config()
            };
            let comm = SoloCommunicator::new();
            let mut observer = NullObserver;
            let mut ctx = RunContext::new(&config, &comm, &store, &mut observer).unwrap();
            let seeded = Class::seeded(&synthetic::disc(SHAPE, 3.0), &ctx.aligner);
            let mut quantizer = Quantizer::new(ctx.ids.clone(), vec![seeded]);

            // A blank image scores zero against every class.
            let corr = quantizer.look_node(&mut ctx, 0, -1, &[0], true).unwrap();
            assert_eq!(corr, 0.0);
            let pending = quantizer.classes()[0].pending_list().len();
            assert_eq!(pending, usize::from(classify_all_images));
            let expected = if classify_all_images { 0 } else { -1 };
            assert_eq!(quantizer.assignment(), &[expected]);
        }
    }

    #[test]
    fn only_neighbours_are_tried_unless_exploring() {
        let ring = synthetic::ring(SHAPE, 4.5, 6.5);
        let store = synthetic::store_from(&[vec![ring.clone()]]);
        for (exploration_images, expected) in [(1e-9, 0), (1e6, 1)] {
            let config = Cl2dConfig {
                classify_all_images: true,
                exploration_images,
                ..correlation_config()
            };
            let comm = SoloCommunicator::new();
            let mut observer = NullObserver;
            let mut ctx = RunContext::new(&config, &comm, &store, &mut observer).unwrap();
            let mut discs = Class::seeded(&synthetic::disc(SHAPE, 3.0), &ctx.aligner);
            discs.set_neighbours(vec![0]);
            let rings = Class::seeded(&ring, &ctx.aligner);
            let mut quantizer = Quantizer::new(ctx.ids.clone(), vec![discs, rings]);

            quantizer.look_node(&mut ctx, 0, 0, &[1, 1], true).unwrap();
            assert_eq!(quantizer.assignment(), &[expected], "exploration {exploration_images}");
        }
    }
}
