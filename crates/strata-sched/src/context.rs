use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use strata_cell::CellGrid;
use strata_sim::CommandSender;
use strata_store::TerrainCellStore;

use crate::PendingRequest;

/// Everything a scheduler instance shares with its collaborators. Built once
/// per world and passed to each component, so independent worlds (and tests)
/// never share state.
#[derive(Clone)]
pub struct TerrainContext {
    pub store: Arc<TerrainCellStore>,
    pub grid: CellGrid,
    pub commands: CommandSender,
    pub(crate) snapshot_tx: Sender<PendingRequest>,
}

impl TerrainContext {
    /// Returns the context and the receiving end of its snapshot request
    /// queue, which belongs to the world thread.
    pub fn new(
        store: Arc<TerrainCellStore>,
        grid: CellGrid,
        commands: CommandSender,
    ) -> (Self, Receiver<PendingRequest>) {
        let (snapshot_tx, snapshot_rx) = unbounded();
        (
            Self {
                store,
                grid,
                commands,
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    /// Requests admitted but not yet taken by the world thread.
    pub fn queued_snapshots(&self) -> usize {
        self.snapshot_tx.len()
    }
}
