//! Splitting one class into two children.
//!
//! Members are first divided at the median of their scores against the
//! parent, then reassigned between the two children until the partition is
//! stable. A child that ends up too small is dropped and the other one is
//! split again; once a split holds, the dropped members are placed in
//! whichever of the final children fits them best.

use ndarray::Array2;
use tracing::debug;

use crate::align::{Assignment, Fit};
use crate::class::Class;
use crate::comm::{Communicator, ReduceOp};
use crate::context::RunContext;
use crate::error::Cl2dResult;
use crate::histogram::{Histogram, HISTOGRAM_BINS};
use crate::image::ImageId;
use crate::quantizer::{share_updates, Quantizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitChild {
    First,
    Second,
}

impl SplitChild {
    fn label(self) -> i64 {
        match self {
            SplitChild::First => 1,
            SplitChild::Second => 2,
        }
    }
}

/// Two committed children and where each of their members went.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub first: Class,
    pub second: Class,
    pub reassignment: Vec<(ImageId, SplitChild)>,
}

impl SplitOutcome {
    fn from_children(first: Class, second: Class) -> Self {
        let members = |class: &Class, child: SplitChild| {
            class
                .members()
                .iter()
                .filter_map(|a| a.image)
                .map(move |id| (id, child))
                .collect::<Vec<_>>()
        };
        let mut reassignment = members(&first, SplitChild::First);
        reassignment.extend(members(&second, SplitChild::Second));
        Self {
            first,
            second,
            reassignment,
        }
    }

    pub fn sizes(&self) -> (usize, usize) {
        (self.first.len(), self.second.len())
    }
}

fn owns<C: Communicator>(comm: &C, i: usize) -> bool {
    i % comm.size() == comm.rank()
}

/// Split `parent` in two. Always produces an outcome covering every member
/// of `parent`; failed attempts fall back to the first seeded split, or to
/// alternating the members.
pub fn split_node<C: Communicator>(ctx: &mut RunContext<'_, C>, parent: &Class) -> Cl2dResult<SplitOutcome> {
    let min_allowed = (ctx.config.min_size_percent / 100.0 * parent.len() as f64).floor() as usize;
    let mut current = parent.clone();
    let mut first_split: Option<SplitOutcome> = None;
    let mut dropped = 0;

    for attempt in 0..ctx.config.max_split_attempts {
        if current.len() < min_allowed {
            debug!(attempt, size = current.len(), min_allowed, "split parent too small");
            break;
        }
        let scores = member_scores(ctx, &current)?;
        let histogram = Histogram::over_samples(&scores, HISTOGRAM_BINS);
        let threshold = histogram.percentile(50.0);
        if threshold == 0.0 || histogram.is_degenerate() {
            if first_split.is_some() {
                break;
            }
            debug!(attempt, size = current.len(), "flat score distribution, alternating members");
            let (first, second, _) = assign_children(ctx, &current, alternate)?;
            return Ok(SplitOutcome::from_children(first, second));
        }

        let (mut first, mut second, labels) = assign_children(ctx, &current, |_, corr| {
            if corr < threshold {
                SplitChild::First
            } else {
                SplitChild::Second
            }
        })?;
        if first_split.is_none() {
            first_split = Some(SplitOutcome::from_children(first.clone(), second.clone()));
        }
        refine(ctx, &current, &mut first, &mut second, labels, min_allowed)?;
        debug!(
            attempt,
            first = first.len(),
            second = second.len(),
            min_allowed,
            "split attempt finished"
        );

        if first.len() < min_allowed {
            dropped += first.len();
            current = second;
        } else if second.len() < min_allowed {
            dropped += second.len();
            current = first;
        } else {
            if dropped > 0 {
                debug!(dropped, "placing members of dropped children");
                distribute(ctx, parent.members(), &mut first, &mut second)?;
            }
            return Ok(SplitOutcome::from_children(first, second));
        }
    }

    match first_split {
        Some(outcome) => {
            debug!("keeping the first split");
            Ok(outcome)
        }
        None => {
            let (first, second, _) = assign_children(ctx, parent, alternate)?;
            Ok(SplitOutcome::from_children(first, second))
        }
    }
}

fn alternate(i: usize, _corr: f64) -> SplitChild {
    if i % 2 == 1 {
        SplitChild::First
    } else {
        SplitChild::Second
    }
}

/// Score of every member against its own class, identical on all workers.
fn member_scores<C: Communicator>(ctx: &RunContext<'_, C>, parent: &Class) -> Cl2dResult<Vec<f64>> {
    let members = parent.members();
    let mut scores = vec![f64::NEG_INFINITY; members.len()];
    for (i, member) in members.iter().enumerate() {
        let Some(id) = member.image.filter(|_| owns(ctx.comm, i)) else {
            continue;
        };
        let image = ctx.read_image(id, false)?;
        scores[i] = parent
            .fit(&image, &ctx.aligner, true)
            .map_or(0.0, |fit| fit.assignment.corr);
    }
    ctx.comm.reduce_and_combine(&mut scores, ReduceOp::Max)?;
    Ok(scores)
}

/// Make `id` a pending member of `class`, aligned when a fit exists.
fn admit(class: &mut Class, id: ImageId, image: &Array2<f64>, fit: Option<Fit>, weight: f64) {
    match fit {
        Some(fit) => {
            let mut assignment = fit.assignment;
            assignment.image = Some(id);
            class.admit(&fit.aligned, &assignment, weight);
        }
        None => {
            class.admit(image, &Assignment::for_image(id, 0.0), weight);
        }
    }
}

/// Distribute the members of `parent` with `choose(member index, score)`,
/// then share and commit both children.
fn assign_children<C: Communicator>(
    ctx: &mut RunContext<'_, C>,
    parent: &Class,
    choose: impl Fn(usize, f64) -> SplitChild,
) -> Cl2dResult<(Class, Class, Vec<i64>)> {
    let shape = ctx.shape();
    let mut first = Class::empty(shape);
    let mut second = Class::empty(shape);
    let mut labels = vec![0i64; parent.len()];
    for (i, member) in parent.members().iter().enumerate() {
        let Some(id) = member.image.filter(|_| owns(ctx.comm, i)) else {
            continue;
        };
        let image = ctx.read_image(id, false)?;
        let fit = parent.fit(&image, &ctx.aligner, true);
        let corr = fit.as_ref().map_or(0.0, |fit| fit.assignment.corr);
        let child = choose(i, corr);
        let (winner, loser) = match child {
            SplitChild::First => (&mut first, &mut second),
            SplitChild::Second => (&mut second, &mut first),
        };
        admit(winner, id, &image, fit, ctx.store.weight(id));
        loser.record_non_member(corr);
        labels[i] = child.label();
    }
    share_updates(ctx.comm, &mut labels, [&mut first, &mut second])?;
    first.commit(&ctx.aligner, false);
    second.commit(&ctx.aligner, false);
    Ok((first, second, labels))
}

/// One pass placing every one of `members` in the child it fits best, then
/// sharing and committing both children. Ties go to the first child.
fn distribute<C: Communicator>(
    ctx: &mut RunContext<'_, C>,
    members: &[Assignment],
    first: &mut Class,
    second: &mut Class,
) -> Cl2dResult<Vec<i64>> {
    let mut labels = vec![0i64; members.len()];
    for (i, member) in members.iter().enumerate() {
        let Some(id) = member.image.filter(|_| owns(ctx.comm, i)) else {
            continue;
        };
        let image = ctx.read_image(id, false)?;
        let (one, two) = (&*first, &*second);
        let aligner = &ctx.aligner;
        let (fit1, fit2) = rayon::join(
            || one.fit(&image, aligner, true),
            || two.fit(&image, aligner, true),
        );
        let child = match (&fit1, &fit2) {
            (Some(a), Some(b)) if b.assignment.outranks(&a.assignment, true) => SplitChild::Second,
            (None, Some(_)) => SplitChild::Second,
            _ => SplitChild::First,
        };
        let (winner, loser, winning_fit, losing_fit) = match child {
            SplitChild::First => (&mut *first, &mut *second, fit1, fit2),
            SplitChild::Second => (&mut *second, &mut *first, fit2, fit1),
        };
        if let Some(other) = losing_fit {
            loser.record_non_member(other.assignment.corr);
        }
        admit(winner, id, &image, winning_fit, ctx.store.weight(id));
        labels[i] = child.label();
    }
    share_updates(ctx.comm, &mut labels, [&mut *first, &mut *second])?;
    first.commit(&ctx.aligner, false);
    second.commit(&ctx.aligner, false);
    Ok(labels)
}

/// Move members between the two children until few of them change side.
fn refine<C: Communicator>(
    ctx: &mut RunContext<'_, C>,
    parent: &Class,
    first: &mut Class,
    second: &mut Class,
    mut labels: Vec<i64>,
    min_allowed: usize,
) -> Cl2dResult<()> {
    let members = parent.members();
    for round in 0..ctx.config.max_iterations {
        let previous = std::mem::replace(&mut labels, distribute(ctx, members, first, second)?);
        let changes = previous.iter().zip(&labels).filter(|(a, b)| a != b).count();
        debug!(round, changes, first = first.len(), second = second.len(), "split refinement");
        if first.len() < min_allowed
            || second.len() < min_allowed
            || (changes as f64) < 0.005 * members.len() as f64
        {
            break;
        }
    }
    Ok(())
}

/// Split the most populated class, appending both children and dropping
/// the parent.
pub fn split_largest_first<C: Communicator>(
    ctx: &mut RunContext<'_, C>,
    quantizer: &mut Quantizer,
) -> Cl2dResult<()> {
    quantizer.sort_by_population();
    let Some(largest) = quantizer.classes().first() else {
        return Ok(());
    };
    let outcome = split_node(ctx, largest)?;
    if ctx.comm.is_root() {
        let (first, second) = outcome.sizes();
        debug!(parent = largest.len(), first, second, "split largest class");
    }
    quantizer.replace_with_split(0, outcome);
    Ok(())
}
