//! Cell addressing and immutable voxel snapshots.
#![forbid(unsafe_code)]

mod coord;
mod grid;
mod snapshot;

pub use coord::{CellCoord, CellKey};
pub use grid::CellGrid;
pub use snapshot::{Voxel, VoxelSnapshot};
