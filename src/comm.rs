//! Collective operations between workers and pull-based task distribution.
//!
//! Every worker runs the same control flow and meets the others only inside
//! the collective calls of [`Communicator`]. A [`LocalCluster`] backs those
//! calls with threads of one process.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use ndarray::Array2;

use crate::error::{Cl2dError, Cl2dResult};

/// Element-wise combination used by [`Communicator::reduce_and_combine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Values that can be combined element-wise across workers.
pub trait Combine: Copy + Send + 'static {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

impl Combine for f64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self + other,
            ReduceOp::Max => self.max(other),
        }
    }
}

impl Combine for i64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self + other,
            ReduceOp::Max => self.max(other),
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self);

    /// Every worker's `value`, in rank order. A worker that cannot read the
    /// value of another one still completes the exchange before failing.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Cl2dResult<Vec<T>>;

    /// Cursor shared by all workers, used by [`TaskDistributor`].
    fn task_cursor(&self) -> &AtomicUsize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Combine `buffer` element-wise across workers; every worker ends up
    /// with the same result.
    fn reduce_and_combine<T: Combine>(&self, buffer: &mut [T], op: ReduceOp) -> Cl2dResult<()> {
        let all = self.all_gather(buffer.to_vec())?;
        if let Some(bad) = all.iter().position(|b| b.len() != buffer.len()) {
            return Err(Cl2dError::Collective(format!(
                "worker {bad} reduced {} values, expected {}",
                all[bad].len(),
                buffer.len()
            )));
        }
        for (i, slot) in buffer.iter_mut().enumerate() {
            let mut combined = all[0][i];
            for other in &all[1..] {
                combined = combined.combine(other[i], op);
            }
            *slot = combined;
        }
        Ok(())
    }

    /// [`Communicator::reduce_and_combine`] over the pixels of an array.
    fn reduce_array(&self, array: &mut Array2<f64>, op: ReduceOp) -> Cl2dResult<()> {
        let mut flat: Vec<f64> = array.iter().copied().collect();
        self.reduce_and_combine(&mut flat, op)?;
        array.iter_mut().zip(flat).for_each(|(dst, v)| *dst = v);
        Ok(())
    }

    /// Concatenation of every worker's list, in rank order.
    fn gather_variable_length<T: Clone + Send + 'static>(&self, list: Vec<T>) -> Cl2dResult<Vec<T>> {
        Ok(self.all_gather(list)?.into_iter().flatten().collect())
    }
}

/// The trivial single-worker communicator.
#[derive(Debug, Default)]
pub struct SoloCommunicator {
    cursor: AtomicUsize,
}

impl SoloCommunicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SoloCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Cl2dResult<Vec<T>> {
        Ok(vec![value])
    }

    fn task_cursor(&self) -> &AtomicUsize {
        &self.cursor
    }
}

type Slot = Mutex<Option<Box<dyn Any + Send>>>;

struct Shared {
    barrier: Barrier,
    slots: Vec<Slot>,
    cursor: AtomicUsize,
}

/// Factory for a group of in-process workers.
pub struct LocalCluster;

impl LocalCluster {
    /// One communicator per worker; hand each to its own thread.
    pub fn new(workers: usize) -> Vec<LocalCommunicator> {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(workers),
            slots: (0..workers).map(|_| Mutex::new(None)).collect(),
            cursor: AtomicUsize::new(0),
        });
        (0..workers)
            .map(|rank| LocalCommunicator {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// A worker of a [`LocalCluster`].
pub struct LocalCommunicator {
    rank: usize,
    shared: Arc<Shared>,
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.slots.len()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Cl2dResult<Vec<T>> {
        *lock(&self.shared.slots[self.rank]) = Some(Box::new(value));
        self.shared.barrier.wait();

        let mut gathered = Vec::with_capacity(self.size());
        let mut mismatch = None;
        for (rank, slot) in self.shared.slots.iter().enumerate() {
            match lock(slot).as_ref().and_then(|v| v.downcast_ref::<T>()) {
                Some(v) => gathered.push(v.clone()),
                None => mismatch = mismatch.or(Some(rank)),
            }
        }
        self.shared.barrier.wait();
        lock(&self.shared.slots[self.rank]).take();

        match mismatch {
            Some(rank) => Err(Cl2dError::Collective(format!(
                "worker {} could not read the contribution of worker {rank}",
                self.rank
            ))),
            None => Ok(gathered),
        }
    }

    fn task_cursor(&self) -> &AtomicUsize {
        &self.shared.cursor
    }
}

/// Hands out inclusive index ranges of a pass from the shared cursor.
#[derive(Debug, Clone, Copy)]
pub struct TaskDistributor {
    total: usize,
    chunk: usize,
}

impl TaskDistributor {
    pub fn new(total: usize, workers: usize) -> Self {
        Self {
            total,
            chunk: (total / (5 * workers.max(1))).max(1),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Next `(first, last)` range, `None` once the pass is exhausted.
    pub fn next_range<C: Communicator>(&self, comm: &C) -> Option<(usize, usize)> {
        let first = comm.task_cursor().fetch_add(self.chunk, Ordering::SeqCst);
        if first >= self.total {
            return None;
        }
        Some((first, (first + self.chunk).min(self.total) - 1))
    }

    /// Rewind the cursor for a new pass. Collective.
    pub fn reset<C: Communicator>(&self, comm: &C) {
        comm.barrier();
        if comm.is_root() {
            comm.task_cursor().store(0, Ordering::SeqCst);
        }
        comm.barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_cluster<R: Send>(workers: usize, job: impl Fn(&LocalCommunicator) -> R + Sync) -> Vec<R> {
        let comms = LocalCluster::new(workers);
        let job = &job;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms.iter().map(|comm| scope.spawn(move || job(comm))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn solo_collectives_are_identity() {
        let comm = SoloCommunicator::new();
        let mut buffer = vec![1.0, -2.0];
        comm.reduce_and_combine(&mut buffer, ReduceOp::Sum).unwrap();
        assert_eq!(buffer, vec![1.0, -2.0]);
        assert_eq!(comm.gather_variable_length(vec![3, 4]).unwrap(), vec![3, 4]);
        assert!(comm.is_root());
    }

    #[test]
    fn all_gather_is_in_rank_order() {
        let results = on_cluster(3, |comm| comm.all_gather(comm.rank() * 10).unwrap());
        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20]);
        }
    }

    #[test]
    fn reductions_agree_on_every_worker() {
        let results = on_cluster(4, |comm| {
            let rank = comm.rank() as i64;
            let mut table = vec![-1i64; 4];
            table[comm.rank()] = rank * 2;
            comm.reduce_and_combine(&mut table, ReduceOp::Max).unwrap();
            let mut sums = vec![rank as f64, 1.0];
            comm.reduce_and_combine(&mut sums, ReduceOp::Sum).unwrap();
            (table, sums)
        });
        for (table, sums) in results {
            assert_eq!(table, vec![0, 2, 4, 6]);
            assert_eq!(sums, vec![6.0, 4.0]);
        }
    }

    #[test]
    fn variable_length_lists_concatenate() {
        let results = on_cluster(3, |comm| {
            let list: Vec<usize> = (0..comm.rank()).map(|i| comm.rank() * 100 + i).collect();
            comm.gather_variable_length(list).unwrap()
        });
        for gathered in results {
            assert_eq!(gathered, vec![100, 200, 201]);
        }
    }

    #[test]
    fn mismatched_exchange_fails_without_deadlock() {
        let results = on_cluster(2, |comm| {
            let outcome = if comm.rank() == 0 {
                comm.all_gather(1i64).map(|_| ())
            } else {
                comm.all_gather(1.0f64).map(|_| ())
            };
            // The cluster must still be usable afterwards.
            let after = comm.all_gather(comm.rank()).unwrap();
            (outcome, after)
        });
        for (outcome, after) in results {
            assert!(matches!(outcome, Err(Cl2dError::Collective(_))));
            assert_eq!(after, vec![0, 1]);
        }
    }

    #[test]
    fn ranges_cover_every_index_once() {
        let total = 103;
        let results = on_cluster(3, |comm| {
            let distributor = TaskDistributor::new(total, comm.size());
            let mut seen = Vec::new();
            for _ in 0..2 {
                distributor.reset(comm);
                let mut pass = Vec::new();
                while let Some((first, last)) = distributor.next_range(comm) {
                    pass.extend(first..=last);
                }
                seen.push(pass);
            }
            seen
        });
        for pass in 0..2 {
            let mut all: Vec<usize> = results.iter().flat_map(|r| r[pass].clone()).collect();
            all.sort_unstable();
            assert_eq!(all, (0..total).collect::<Vec<_>>());
        }
    }

    #[test]
    fn chunk_is_never_zero() {
        assert_eq!(TaskDistributor::new(3, 8).chunk(), 1);
        assert_eq!(TaskDistributor::new(100, 2).chunk(), 10);
        let comm = SoloCommunicator::new();
        let distributor = TaskDistributor::new(0, 1);
        distributor.reset(&comm);
        assert_eq!(distributor.next_range(&comm), None);
    }
}
