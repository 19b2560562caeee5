//! Level loop and run entry points.

use ndarray::Array2;
use tracing::info;

use crate::comm::{Communicator, LocalCluster, SoloCommunicator};
use crate::config::Cl2dConfig;
use crate::context::RunContext;
use crate::error::{Cl2dError, Cl2dResult};
use crate::image::ImageId;
use crate::output::{ClassSummary, LevelReport, NullObserver, RunObserver};
use crate::quantizer::Quantizer;
use crate::split::split_largest_first;
use crate::store::{ImageStore, MetadataRow, MetadataTable};

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Classes sorted by descending membership.
    pub classes: Vec<ClassSummary>,
    /// Class index per image, `-1` when unassigned.
    pub assignment: Vec<(ImageId, i64)>,
    pub levels: Vec<LevelReport>,
    /// Correntropy kernel width measured during initialization.
    pub sigma: f64,
}

impl Classification {
    pub fn class_sizes(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.size).collect()
    }

    /// Class holding `id`, if it is a committed member of one.
    pub fn class_of(&self, id: ImageId) -> Option<usize> {
        self.classes
            .iter()
            .find(|c| c.members.iter().any(|a| a.image == Some(id)))
            .map(|c| c.index)
    }

    /// One row per image: members get their class and alignment, every
    /// other image is written as unclassified and disabled.
    pub fn write_metadata(&self, table: &mut dyn MetadataTable) {
        for (id, _) in &self.assignment {
            table.set_row(*id, MetadataRow::unclassified());
        }
        for class in &self.classes {
            for member in &class.members {
                if let Some(id) = member.image {
                    table.set_row(id, MetadataRow::classified(class.index, &member.geometry));
                }
            }
        }
    }
}

/// Run the full classification on one worker. Every worker of a group must
/// call this with the same arguments.
pub fn classify<C: Communicator>(
    ctx: &mut RunContext<'_, C>,
    prototypes: Option<&[Array2<f64>]>,
) -> Cl2dResult<Classification> {
    let mut quantizer = Quantizer::initialize(ctx, prototypes)?;
    let mut level = 0;
    let mut levels = vec![quantizer.run_level(ctx, level)?];

    while quantizer.len() < ctx.config.final_classes {
        let q = quantizer.len();
        let cleaned = quantizer.clean_empty_classes();
        let splits = q.min(ctx.config.final_classes - q) + cleaned;
        if ctx.comm.is_root() {
            info!(classes = q, cleaned, splits, "splitting classes");
        }
        for _ in 0..splits {
            split_largest_first(ctx, &mut quantizer)?;
        }
        level += 1;
        levels.push(quantizer.run_level(ctx, level)?);
    }

    if let Some(err) = ctx.take_observer_error() {
        return Err(err);
    }
    if ctx.comm.is_root() {
        info!(
            levels = levels.len(),
            class_sizes = ?quantizer.class_sizes(),
            "classification finished"
        );
    }
    Ok(Classification {
        classes: quantizer.summaries(),
        assignment: quantizer
            .ids()
            .iter()
            .copied()
            .zip(quantizer.assignment().iter().copied())
            .collect(),
        levels,
        sigma: ctx.aligner.sigma(),
    })
}

/// Run on a single worker.
pub fn run_solo(
    config: &Cl2dConfig,
    store: &dyn ImageStore,
    observer: &mut dyn RunObserver,
    prototypes: Option<&[Array2<f64>]>,
) -> Cl2dResult<Classification> {
    let comm = SoloCommunicator::new();
    let mut ctx = RunContext::new(config, &comm, store, observer)?;
    classify(&mut ctx, prototypes)
}

/// Run on `workers` threads of this process. Only the first worker reports
/// to `observer`.
pub fn run_local_cluster(
    config: &Cl2dConfig,
    store: &dyn ImageStore,
    workers: usize,
    observer: &mut dyn RunObserver,
    prototypes: Option<&[Array2<f64>]>,
) -> Cl2dResult<Classification> {
    let comms = LocalCluster::new(workers);
    let mut observer = Some(observer);
    let results: Vec<Cl2dResult<Classification>> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let root_observer = if comm.is_root() { observer.take() } else { None };
                scope.spawn(move || {
                    let mut null = NullObserver;
                    let observer: &mut dyn RunObserver = match root_observer {
                        Some(observer) => observer,
                        None => &mut null,
                    };
                    let mut ctx = RunContext::new(config, comm, store, observer)?;
                    classify(&mut ctx, prototypes)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Cl2dError::Collective("a worker panicked".to_string())))
            })
            .collect()
    });

    let mut root = None;
    for result in results {
        let classification = result?;
        root.get_or_insert(classification);
    }
    root.ok_or_else(|| Cl2dError::Collective("no worker produced a result".to_string()))
}
