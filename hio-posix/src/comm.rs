//! Communication abstraction (design note 9: "MPI conditionalisation").
//!
//! The original source carries two code paths, one built with MPI and one
//! without. We express that as a single `Communicator` trait with a
//! trivial single-process implementation; no compile-time flag leaks into
//! the dataset engine itself. Three communicators are named in §5: the
//! dataset communicator (all ranks), the shared communicator (ranks on one
//! node), and the leader communicator (one leader per node). In this crate
//! a single `Communicator` plays the dataset-communicator role; its
//! `shared_*` methods stand in for the node-local view, and `is_leader`
//! stands in for leader-communicator membership.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

pub trait Communicator: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    fn shared_rank(&self) -> i32;
    fn shared_size(&self) -> i32;

    /// Whether this rank is the node leader (shared-communicator rank 0).
    fn is_leader(&self) -> bool {
        self.shared_rank() == 0
    }

    /// Every rank blocks until every other rank has called `barrier` (§5
    /// ordering guarantee (d)).
    fn barrier(&self);

    /// Rank 0's `data` is distributed to every rank; other ranks' `data`
    /// argument is ignored. Every rank, including rank 0, gets the same
    /// bytes back.
    fn broadcast(&self, data: Option<Vec<u8>>) -> Vec<u8>;

    /// Rank 0's `items` (one entry per rank, indexed by rank) is split so
    /// each rank receives only its own entry; other ranks' `items` argument
    /// is ignored. Used for the per-rank manifest-id assignment the node
    /// leader hands out at dataset create (§4.7 step 4).
    fn scatter(&self, items: Option<Vec<Vec<u8>>>) -> Vec<u8>;

    /// Collective min-reduction used on dataset close (§5(c), §7): every
    /// rank observes the same, most-severe return code.
    fn allreduce_min(&self, value: i32) -> i32;

    /// Every rank's `data` is collected to rank 0, in rank order. Rank 0's
    /// result has one entry per rank (`result[r]` is rank `r`'s `data`);
    /// every other rank gets an empty vector back, since only rank 0 needs
    /// the aggregate (§4.7 close step 3, "gather segments from all ranks to
    /// rank 0"; mirrors the original's `hioi_dataset_gather_manifest`).
    fn gather(&self, data: &[u8]) -> Vec<Vec<u8>>;
}

/// Trivial communicator for single-process use: every collective is a
/// no-op or identity, because there is exactly one participant.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> i32 {
        0
    }
    fn size(&self) -> i32 {
        1
    }
    fn shared_rank(&self) -> i32 {
        0
    }
    fn shared_size(&self) -> i32 {
        1
    }
    fn barrier(&self) {}
    fn broadcast(&self, data: Option<Vec<u8>>) -> Vec<u8> {
        data.unwrap_or_default()
    }
    fn scatter(&self, items: Option<Vec<Vec<u8>>>) -> Vec<u8> {
        items.and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) }).unwrap_or_default()
    }
    fn allreduce_min(&self, value: i32) -> i32 {
        value
    }
    fn gather(&self, data: &[u8]) -> Vec<Vec<u8>> {
        vec![data.to_vec()]
    }
}

/// An in-process, multi-thread communicator used only by tests that need
/// genuinely concurrent ranks (§8 property 3, "reservation exclusivity")
/// without pulling in an MPI dependency. All simulated ranks are on the
/// same "node", so `shared_*` equals `rank`/`size`.
pub struct ThreadCommunicator {
    rank: i32,
    size: i32,
    step_barrier: Arc<Barrier>,
    bcast_barrier: Arc<Barrier>,
    bcast_slot: Arc<Mutex<Option<Vec<u8>>>>,
    scatter_barrier: Arc<Barrier>,
    scatter_slot: Arc<Mutex<Option<Vec<Vec<u8>>>>>,
    min_barrier: Arc<Barrier>,
    min_value: Arc<AtomicI64>,
    gather_barrier: Arc<Barrier>,
    gather_slots: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

impl ThreadCommunicator {
    /// Builds `size` linked handles, one per simulated rank.
    pub fn fleet(size: usize) -> Vec<Self> {
        let step_barrier = Arc::new(Barrier::new(size));
        let bcast_barrier = Arc::new(Barrier::new(size));
        let bcast_slot = Arc::new(Mutex::new(None));
        let scatter_barrier = Arc::new(Barrier::new(size));
        let scatter_slot = Arc::new(Mutex::new(None));
        let min_barrier = Arc::new(Barrier::new(size));
        let min_value = Arc::new(AtomicI64::new(i64::MAX));
        let gather_barrier = Arc::new(Barrier::new(size));
        let gather_slots = Arc::new(Mutex::new((0..size).map(|_| None).collect()));
        (0..size)
            .map(|rank| ThreadCommunicator {
                rank: rank as i32,
                size: size as i32,
                step_barrier: step_barrier.clone(),
                bcast_barrier: bcast_barrier.clone(),
                bcast_slot: bcast_slot.clone(),
                scatter_barrier: scatter_barrier.clone(),
                scatter_slot: scatter_slot.clone(),
                min_barrier: min_barrier.clone(),
                min_value: min_value.clone(),
                gather_barrier: gather_barrier.clone(),
                gather_slots: gather_slots.clone(),
            })
            .collect()
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> i32 {
        self.rank
    }
    fn size(&self) -> i32 {
        self.size
    }
    fn shared_rank(&self) -> i32 {
        self.rank
    }
    fn shared_size(&self) -> i32 {
        self.size
    }

    fn barrier(&self) {
        self.step_barrier.wait();
    }

    fn broadcast(&self, data: Option<Vec<u8>>) -> Vec<u8> {
        if self.rank == 0 {
            *self.bcast_slot.lock().unwrap() = data;
        }
        self.bcast_barrier.wait();
        let out = self.bcast_slot.lock().unwrap().clone().unwrap_or_default();
        self.bcast_barrier.wait();
        out
    }

    fn scatter(&self, items: Option<Vec<Vec<u8>>>) -> Vec<u8> {
        if self.rank == 0 {
            *self.scatter_slot.lock().unwrap() = items;
        }
        self.scatter_barrier.wait();
        let mine = self.scatter_slot.lock().unwrap().as_ref().and_then(|v| v.get(self.rank as usize).cloned()).unwrap_or_default();
        self.scatter_barrier.wait();
        mine
    }

    fn allreduce_min(&self, value: i32) -> i32 {
        self.min_value.fetch_min(value as i64, Ordering::SeqCst);
        self.min_barrier.wait();
        let result = self.min_value.load(Ordering::SeqCst) as i32;
        self.min_barrier.wait();
        if self.rank == 0 {
            self.min_value.store(i64::MAX, Ordering::SeqCst);
        }
        self.min_barrier.wait();
        result
    }

    fn gather(&self, data: &[u8]) -> Vec<Vec<u8>> {
        self.gather_slots.lock().unwrap()[self.rank as usize] = Some(data.to_vec());
        self.gather_barrier.wait();
        let result = if self.rank == 0 {
            self.gather_slots.lock().unwrap().iter().map(|s| s.clone().unwrap_or_default()).collect()
        } else {
            Vec::new()
        };
        self.gather_barrier.wait();
        result
    }
}
