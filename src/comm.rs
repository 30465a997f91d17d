//! Collective operations between workers
//!
//! The engine's concurrency model is a fixed pool of workers with private
//! state, coordinating only through collective operations: barrier,
//! broadcast, gather and all-gather. Ownership of shared accumulators moves
//! through these calls, never through shared mutable references, so no
//! locking discipline leaks into the engine itself.
//!
//! [`LocalCluster`] runs `n` workers as scoped threads in-process, which
//! keeps the pass sequence worker-count-agnostic and directly testable.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

struct RoundState {
    deposited: usize,
    collected: usize,
    ready: bool,
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

struct CommCore {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

impl CommCore {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(RoundState {
                deposited: 0,
                collected: 0,
                ready: false,
                slots: (0..size).map(|_| None).collect(),
            }),
            cv: Condvar::new(),
        }
    }
}

/// Handle of one worker onto the collective operations of its pool.
#[derive(Clone)]
pub struct Collective {
    rank: usize,
    size: usize,
    core: Arc<CommCore>,
}

impl Collective {
    /// A standalone single-worker collective.
    pub fn solo() -> Self {
        Self { rank: 0, size: 1, core: Arc::new(CommCore::new(1)) }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when this worker owns channel `ch` under the modulo partition.
    pub fn owns(&self, ch: usize) -> bool {
        ch % self.size == self.rank
    }

    /// Rank owning channel `ch`.
    pub fn owner_of(&self, ch: usize) -> usize {
        ch % self.size
    }

    /// Every worker deposits one value; every worker receives all of them
    /// in rank order. All other collectives are built on this.
    fn exchange<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        let core = &self.core;
        let mut st = core.state.lock().unwrap();

        // A previous round may still be draining.
        while st.ready {
            st = core.cv.wait(st).unwrap();
        }

        st.slots[self.rank] = Some(Box::new(value));
        st.deposited += 1;
        if st.deposited == core.size {
            st.ready = true;
            core.cv.notify_all();
        } else {
            while !st.ready {
                st = core.cv.wait(st).unwrap();
            }
        }

        let out: Vec<T> = st
            .slots
            .iter()
            .map(|s| {
                s.as_ref()
                    .and_then(|b| b.downcast_ref::<T>())
                    .expect("collective type mismatch")
                    .clone()
            })
            .collect();

        st.collected += 1;
        if st.collected == core.size {
            for s in st.slots.iter_mut() {
                *s = None;
            }
            st.deposited = 0;
            st.collected = 0;
            st.ready = false;
            core.cv.notify_all();
        }
        out
    }

    /// All workers wait until every worker has arrived.
    pub fn barrier(&self) {
        self.exchange(());
    }

    /// One value per worker, in rank order.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        self.exchange(value)
    }

    /// Concatenation of every worker's vector, in rank order.
    pub fn all_gather_concat<T: Clone + Send + 'static>(&self, value: Vec<T>) -> Vec<T> {
        self.exchange(value).into_iter().flatten().collect()
    }

    /// The root's value, delivered to everyone. Only the root needs to
    /// supply one.
    pub fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, root: usize) -> T {
        let mut all = self.exchange(value);
        all.swap_remove(root).expect("broadcast root supplied no value")
    }

    /// Concatenated vectors at the root, `None` elsewhere.
    pub fn gather<T: Clone + Send + 'static>(
        &self,
        value: Vec<T>,
        root: usize,
    ) -> Option<Vec<T>> {
        let all = self.exchange(value);
        (self.rank == root).then(|| all.into_iter().flatten().collect())
    }

    /// Global sum of one counter.
    pub fn sum_u64(&self, value: u64) -> u64 {
        self.exchange(value).into_iter().sum()
    }
}

/// In-process worker pool executing the same closure on every rank.
pub struct LocalCluster;

impl LocalCluster {
    /// Run `f` on `size` workers and return every worker's result in rank
    /// order. Workers execute the same pass sequence in lock-step through
    /// the collective operations.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(Collective) -> T + Sync,
        T: Send,
    {
        assert!(size >= 1, "worker pool needs at least one worker");
        if size == 1 {
            return vec![f(Collective::solo())];
        }
        let core = Arc::new(CommCore::new(size));
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm = Collective { rank, size, core: core.clone() };
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker panicked")).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_gather_rank_order() {
        let results = LocalCluster::run(4, |comm| comm.all_gather(comm.rank() * 10));
        for r in results {
            assert_eq!(r, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn test_all_gather_concat() {
        let results = LocalCluster::run(3, |comm| {
            comm.all_gather_concat(vec![comm.rank(); comm.rank()])
        });
        for r in results {
            assert_eq!(r, vec![1, 2, 2]);
        }
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = LocalCluster::run(3, |comm| {
            let value = (comm.rank() == 1).then_some("payload".to_string());
            comm.broadcast(value, 1)
        });
        assert!(results.iter().all(|v| v == "payload"));
    }

    #[test]
    fn test_gather_only_at_root() {
        let results = LocalCluster::run(3, |comm| comm.gather(vec![comm.rank()], 0));
        assert_eq!(results[0], Some(vec![0, 1, 2]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_sum_across_workers() {
        let results = LocalCluster::run(4, |comm| comm.sum_u64(comm.rank() as u64 + 1));
        assert!(results.iter().all(|&v| v == 10));
    }

    #[test]
    fn test_barrier_separates_phases() {
        let counter = AtomicUsize::new(0);
        LocalCluster::run(4, |comm| {
            counter.fetch_add(1, Ordering::SeqCst);
            comm.barrier();
            // Nobody passes the barrier before everyone incremented.
            assert_eq!(counter.load(Ordering::SeqCst), 4);
            comm.barrier();
        });
    }

    #[test]
    fn test_repeated_rounds_do_not_cross() {
        let results = LocalCluster::run(2, |comm| {
            let mut acc = Vec::new();
            for round in 0..100u64 {
                let got = comm.all_gather(round * 2 + comm.rank() as u64);
                assert_eq!(got, vec![round * 2, round * 2 + 1]);
                acc.push(got[0]);
            }
            acc.len()
        });
        assert_eq!(results, vec![100, 100]);
    }

    #[test]
    fn test_modulo_ownership() {
        let results = LocalCluster::run(3, |comm| {
            (0..9).filter(|&ch| comm.owns(ch)).collect::<Vec<_>>()
        });
        assert_eq!(results[0], vec![0, 3, 6]);
        assert_eq!(results[1], vec![1, 4, 7]);
        assert_eq!(results[2], vec![2, 5, 8]);
    }
}
