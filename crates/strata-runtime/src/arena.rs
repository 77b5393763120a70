use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use strata_shape::BuildScratch;

/// Voxel slots a worker keeps between jobs: one 64^3 cell.
pub const MAX_RETAINED_VOXELS: usize = 64 * 64 * 64;

/// Build scratch owned by a single worker thread for its whole life.
///
/// Workers never share or hand back their arena, so there is no pool to
/// wait on. Buffers that grew past `retain` for an unusually large cell are
/// released after the job.
pub struct WorkerArena {
    scratch: BuildScratch,
    retain: usize,
    live: Arc<AtomicUsize>,
}

impl WorkerArena {
    /// `live` counts arenas currently held by workers.
    pub fn new(live: &Arc<AtomicUsize>, retain: usize) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self {
            scratch: BuildScratch::new(),
            retain,
            live: Arc::clone(live),
        }
    }

    pub fn scratch(&mut self) -> &mut BuildScratch {
        &mut self.scratch
    }

    /// Call once the job's shape has been handed off.
    pub fn end_job(&mut self) {
        let before = self.scratch.retained();
        self.scratch.trim(self.retain);
        if self.scratch.retained() < before {
            log::trace!(target: "runtime", "released {} scratch slots", before);
        }
    }

    pub fn builds(&self) -> u64 {
        self.scratch.builds
    }
}

impl Drop for WorkerArena {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cell::{CellCoord, Voxel, VoxelSnapshot};
    use strata_shape::{BoxMergeBuilder, ShapeBuilder};

    fn build_into(arena: &mut WorkerArena, size: usize) {
        let snap = VoxelSnapshot::filled(CellCoord::default(), size, Voxel(1));
        BoxMergeBuilder::default()
            .build(&snap, arena.scratch())
            .unwrap();
        arena.end_job();
    }

    #[test]
    fn arena_is_reused_across_jobs() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut arena = WorkerArena::new(&live, 4096);
        build_into(&mut arena, 8);
        let kept = arena.scratch().retained();
        build_into(&mut arena, 8);
        assert_eq!(arena.builds(), 2);
        assert!(kept >= 512);
        assert_eq!(arena.scratch().retained(), kept);
    }

    #[test]
    fn oversized_buffers_are_released() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut arena = WorkerArena::new(&live, 100);
        build_into(&mut arena, 4);
        assert!(arena.scratch().retained() >= 64);
        build_into(&mut arena, 8);
        assert_eq!(arena.scratch().retained(), 0);
        assert_eq!(arena.builds(), 2);
    }

    #[test]
    fn live_count_follows_arena_lifetime() {
        let live = Arc::new(AtomicUsize::new(0));
        let a = WorkerArena::new(&live, MAX_RETAINED_VOXELS);
        let b = WorkerArena::new(&live, MAX_RETAINED_VOXELS);
        assert_eq!(live.load(Ordering::Relaxed), 2);
        drop(a);
        assert_eq!(live.load(Ordering::Relaxed), 1);
        drop(b);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }
}
