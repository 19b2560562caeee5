use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::align::Aligner;
use crate::comm::{Communicator, TaskDistributor};
use crate::config::Cl2dConfig;
use crate::error::{Cl2dError, Cl2dResult};
use crate::image::{normalize, ImageId};
use crate::output::RunObserver;
use crate::store::ImageStore;

/// Per-worker state of a run: everything the quantizer and the split
/// controller need besides the classes themselves.
pub struct RunContext<'a, C: Communicator> {
    pub config: &'a Cl2dConfig,
    pub comm: &'a C,
    pub store: &'a dyn ImageStore,
    pub ids: Vec<ImageId>,
    pub distributor: TaskDistributor,
    pub aligner: Aligner,
    pub rng: ChaCha8Rng,
    pub observer: &'a mut dyn RunObserver,
    observer_error: Option<Cl2dError>,
}

impl<'a, C: Communicator> RunContext<'a, C> {
    /// Validates the configuration and takes the image shape from the first
    /// image of the store.
    pub fn new(
        config: &'a Cl2dConfig,
        comm: &'a C,
        store: &'a dyn ImageStore,
        observer: &'a mut dyn RunObserver,
    ) -> Cl2dResult<Self> {
        config.validate()?;
        let ids = store.ids();
        let first = *ids
            .first()
            .ok_or_else(|| Cl2dError::Validation("the image store is empty".to_string()))?;
        let shape = store.read(first)?.dim();
        if shape.0 == 0 || shape.1 == 0 {
            return Err(Cl2dError::Validation(format!(
                "image {first} has an empty shape {shape:?}"
            )));
        }
        Ok(Self {
            config,
            comm,
            store,
            distributor: TaskDistributor::new(ids.len(), comm.size()),
            ids,
            aligner: Aligner::new(shape, config),
            rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(comm.rank() as u64)),
            observer,
            observer_error: None,
        })
    }

    /// Run an observer hook on the root worker. Failures are logged and the
    /// run goes on; the first one is kept for
    /// [`RunContext::take_observer_error`].
    pub fn notify(&mut self, hook: impl FnOnce(&mut dyn RunObserver) -> Cl2dResult<()>) {
        if !self.comm.is_root() {
            return;
        }
        if let Err(err) = hook(&mut *self.observer) {
            tracing::warn!(error = %err, "run observer failed");
            self.observer_error.get_or_insert(err);
        }
    }

    pub fn take_observer_error(&mut self) -> Option<Cl2dError> {
        self.observer_error.take()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.aligner.shape()
    }

    pub fn n_images(&self) -> usize {
        self.ids.len()
    }

    /// Ranking by raw score instead of likelihood.
    pub fn classic(&self, classes: usize) -> bool {
        self.config.classical_multiref || classes == 1
    }

    /// Read an image normalized to zero mean and unit variance.
    pub fn read_image(&self, id: ImageId, with_geometry: bool) -> Cl2dResult<Array2<f64>> {
        let pixels = if with_geometry {
            self.store.read_with_geometry(id)?
        } else {
            self.store.read(id)?
        };
        if pixels.dim() != self.shape() {
            return Err(Cl2dError::Validation(format!(
                "image {id} has shape {:?}, expected {:?}",
                pixels.dim(),
                self.shape()
            )));
        }
        Ok(normalize(&pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloCommunicator;
    use crate::image::ImageRecord;
    use crate::output::NullObserver;
    use crate::store::InMemoryImageStore;

    #[test]
    fn rejects_empty_store_and_mismatched_images() {
        let config = Cl2dConfig::default();
        let comm = SoloCommunicator::new();
        let mut observer = NullObserver;

        let empty = InMemoryImageStore::new();
        assert!(matches!(
            RunContext::new(&config, &comm, &empty, &mut observer),
            Err(Cl2dError::Validation(_))
        ));

        let store = InMemoryImageStore::from_records([
            ImageRecord::new(ImageId(0), Array2::from_elem((8, 8), 2.0)),
            ImageRecord::new(ImageId(1), Array2::zeros((6, 8))),
        ]);
        let ctx = RunContext::new(&config, &comm, &store, &mut observer).unwrap();
        assert_eq!(ctx.shape(), (8, 8));
        assert_eq!(ctx.n_images(), 2);
        assert!(ctx.read_image(ImageId(0), false).unwrap().iter().all(|&v| v == 0.0));
        assert!(matches!(ctx.read_image(ImageId(1), false), Err(Cl2dError::Validation(_))));
    }

    #[test]
    fn single_class_runs_are_classic() {
        let config = Cl2dConfig::default();
        let comm = SoloCommunicator::new();
        let mut observer = NullObserver;
        let store = InMemoryImageStore::from_records([ImageRecord::new(ImageId(0), Array2::zeros((8, 8)))]);
        let ctx = RunContext::new(&config, &comm, &store, &mut observer).unwrap();
        assert!(ctx.classic(1));
        assert!(!ctx.classic(2));
    }
}
