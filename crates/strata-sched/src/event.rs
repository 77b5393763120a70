use std::sync::Arc;

use crossbeam_channel::Sender;
use strata_cell::CellKey;
use strata_store::TerrainCellStore;

use crate::{BodyId, Priority, SchedulerConfig, TrackerConfig};

/// Notifications for the scheduler thread, applied in arrival order at the
/// start of the next pass.
#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    BodyAdded(BodyId),
    BodyRemoved(BodyId),
    /// A voxel changed at this world position. Sent by the world thread after
    /// the edit is applied.
    VoxelEdited { wx: i32, wy: i32, wz: i32 },
    /// The world dropped the region backing this cell.
    CellUnloaded(CellKey),
    RequestChunk(CellKey),
    ReleaseChunk(CellKey),
    Prioritize(CellKey, Priority),
    /// The world thread could not snapshot the cell; its claim was released.
    SnapshotUnavailable(CellKey),
    /// The world thread dropped a queued claim because the cell had no
    /// references when it came up.
    ClaimAbandoned(CellKey),
    ConfigChanged(SchedulerConfig, TrackerConfig),
    Shutdown,
}

/// Cloneable entry point for collaborators on any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<SchedulerEvent>,
    store: Arc<TerrainCellStore>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: Sender<SchedulerEvent>, store: Arc<TerrainCellStore>) -> Self {
        Self { tx, store }
    }

    /// Returns false once the scheduler has stopped.
    pub fn send(&self, event: SchedulerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn body_added(&self, body: BodyId) -> bool {
        self.send(SchedulerEvent::BodyAdded(body))
    }

    pub fn body_removed(&self, body: BodyId) -> bool {
        self.send(SchedulerEvent::BodyRemoved(body))
    }

    pub fn voxel_edited(&self, wx: i32, wy: i32, wz: i32) -> bool {
        self.send(SchedulerEvent::VoxelEdited { wx, wy, wz })
    }

    pub fn cell_unloaded(&self, key: CellKey) -> bool {
        self.send(SchedulerEvent::CellUnloaded(key))
    }

    /// Hold `key` resident on behalf of an external caller. Repeating the
    /// call while held does nothing.
    pub fn request_chunk(&self, key: CellKey) -> bool {
        self.send(SchedulerEvent::RequestChunk(key))
    }

    pub fn release_chunk(&self, key: CellKey) -> bool {
        self.send(SchedulerEvent::ReleaseChunk(key))
    }

    pub fn prioritize(&self, key: CellKey, priority: Priority) -> bool {
        self.send(SchedulerEvent::Prioritize(key, priority))
    }

    pub fn reload_config(&self, sched: SchedulerConfig, tracker: TrackerConfig) -> bool {
        self.send(SchedulerEvent::ConfigChanged(sched, tracker))
    }

    pub fn shutdown(&self) -> bool {
        self.send(SchedulerEvent::Shutdown)
    }

    /// True once the cell holds a full-resolution build. Reads the store
    /// directly, so it never waits on the scheduler.
    pub fn is_section_ready(&self, key: CellKey) -> bool {
        self.store.is_section_ready(key)
    }

    pub fn pending_events(&self) -> usize {
        self.tx.len()
    }
}
