use std::sync::Arc;

use crossbeam_channel::Receiver;
use strata_cell::{CellKey, VoxelSnapshot};
use strata_runtime::{BuildJob, BuildLane, JobSink};
use strata_store::{CellState, TerrainCellStore};

use crate::{PendingRequest, SchedulerEvent, SchedulerHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("cell {0} is not loaded")]
    NotLoaded(CellKey),
}

/// The world collaborator. Implementations copy one cell's voxels into a
/// self-contained snapshot and are called only on the thread owning the world.
pub trait SnapshotProvider {
    fn snapshot(&mut self, key: CellKey) -> Result<VoxelSnapshot, SnapshotError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub taken: usize,
    pub unavailable: usize,
    /// Requests whose claim was no longer current, or whose cell lost every
    /// reference while queued.
    pub skipped: usize,
}

/// World-thread side of the snapshot queue.
pub struct SnapshotService {
    store: Arc<TerrainCellStore>,
    requests: Receiver<PendingRequest>,
    sink: Arc<dyn JobSink>,
    events: SchedulerHandle,
}

impl SnapshotService {
    pub fn new(
        store: Arc<TerrainCellStore>,
        requests: Receiver<PendingRequest>,
        sink: Arc<dyn JobSink>,
        events: SchedulerHandle,
    ) -> Self {
        Self {
            store,
            requests,
            sink,
            events,
        }
    }

    pub fn queued(&self) -> usize {
        self.requests.len()
    }

    /// Fulfil up to `max` queued requests. Call once per world tick from the
    /// thread that owns `provider`; requests beyond `max` wait for the next call.
    pub fn service<P: SnapshotProvider + ?Sized>(&self, provider: &mut P, max: usize) -> SnapshotStats {
        let mut stats = SnapshotStats::default();
        for req in self.requests.try_iter().take(max) {
            if !self.claim_is_current(&req) {
                stats.skipped += 1;
                continue;
            }
            if self.store.ref_count(req.index) == 0 {
                if self.store.abandon_generation(req.index, req.version) {
                    self.events.send(SchedulerEvent::ClaimAbandoned(req.key));
                }
                stats.skipped += 1;
                continue;
            }
            match provider.snapshot(req.key) {
                Ok(snapshot) => {
                    let lane = if req.priority.is_edit() {
                        BuildLane::Edit
                    } else {
                        BuildLane::Background
                    };
                    self.sink.submit(
                        BuildJob {
                            key: req.key,
                            index: req.index,
                            version: req.version,
                            initial: req.initial,
                            snapshot,
                        },
                        lane,
                    );
                    stats.taken += 1;
                }
                Err(SnapshotError::NotLoaded(key)) => {
                    log::debug!(target: "sched", "snapshot unavailable for {}", key);
                    self.store.abandon_generation(req.index, req.version);
                    self.events.send(SchedulerEvent::SnapshotUnavailable(key));
                    stats.unavailable += 1;
                }
            }
        }
        stats
    }

    fn claim_is_current(&self, req: &PendingRequest) -> bool {
        self.store.key_at(req.index) == Some(req.key)
            && self.store.rebuild_version(req.index) == req.version
            && self.store.state(req.index) == CellState::Scheduled
    }
}
