//! Structure-of-arrays store of terrain collision cells. Per-slot state is atomic; the key index is a sharded map.
#![forbid(unsafe_code)]

mod state;
mod store;

pub use state::{CellState, ShapeHandle};
pub use store::{
    CellIndex, CellRecord, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CELLS, InstallRejected,
    RemovedCell, StoreStats, TerrainCellStore,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The slot directory is full. Continuing would break the one-slot-per-key
    /// invariant, so owners treat this as fatal.
    #[error("terrain cell store exhausted ({capacity} slots)")]
    CapacityExhausted { capacity: usize },
}
