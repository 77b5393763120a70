//! Collision shape descriptions built from voxel snapshots.
//!
//! A shape is a compound of axis-aligned boxes in cell-local voxel units.
//! Builders are pure: they read a snapshot and a reusable scratch buffer and
//! return a description; installing it in a simulation is someone else's job.
#![forbid(unsafe_code)]

mod greedy;

use serde::{Deserialize, Serialize};
use strata_cell::{CellCoord, CellGrid, VoxelSnapshot};
use strata_geom::{Aabb, Vec3};

pub use greedy::{BoxMergeBuilder, DEFAULT_MAX_BOXES};

/// Box in cell-local voxel units; `max` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeBox {
    pub min: [u16; 3],
    pub max: [u16; 3],
}

impl ShapeBox {
    #[inline]
    pub fn volume(&self) -> u64 {
        (0..3)
            .map(|a| u64::from(self.max[a] - self.min[a]))
            .product()
    }

    #[inline]
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        let p = [x, y, z];
        (0..3).all(|a| p[a] >= usize::from(self.min[a]) && p[a] < usize::from(self.max[a]))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescription {
    pub cell: CellCoord,
    pub cell_size: usize,
    pub boxes: Vec<ShapeBox>,
}

impl ShapeDescription {
    pub fn empty(cell: CellCoord, cell_size: usize) -> Self {
        Self {
            cell,
            cell_size,
            boxes: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn solid_volume(&self) -> u64 {
        self.boxes.iter().map(ShapeBox::volume).sum()
    }

    /// Boxes translated into world units.
    pub fn world_boxes(&self) -> impl Iterator<Item = Aabb> + '_ {
        let (x0, y0, z0) = CellGrid::new(self.cell_size).origin(self.cell);
        let base = Vec3::new(x0 as f32, y0 as f32, z0 as f32);
        self.boxes.iter().map(move |b| {
            let lo = Vec3::new(f32::from(b.min[0]), f32::from(b.min[1]), f32::from(b.min[2]));
            let hi = Vec3::new(f32::from(b.max[0]), f32::from(b.max[1]), f32::from(b.max[2]));
            Aabb::new(base + lo, base + hi)
        })
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.world_boxes().reduce(|a, b| a.union(&b))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("degenerate snapshot for cell {cell:?}: {reason}")]
    Degenerate { cell: CellCoord, reason: &'static str },
    #[error("cell {cell:?} needs more than {limit} boxes")]
    TooManyBoxes { cell: CellCoord, limit: usize },
}

/// Per-worker buffers reused across builds.
#[derive(Debug, Default)]
pub struct BuildScratch {
    pub(crate) consumed: Vec<bool>,
    pub builds: u64,
}

impl BuildScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&mut self, len: usize) {
        self.consumed.clear();
        self.consumed.resize(len, false);
        self.builds += 1;
    }

    /// Voxel slots the buffers can hold without reallocating.
    pub fn retained(&self) -> usize {
        self.consumed.capacity()
    }

    /// Release buffers grown past `max` voxel slots.
    pub fn trim(&mut self, max: usize) {
        if self.consumed.capacity() > max {
            self.consumed = Vec::new();
        }
    }
}

pub trait ShapeBuilder: Send + Sync {
    fn build(
        &self,
        snapshot: &VoxelSnapshot,
        scratch: &mut BuildScratch,
    ) -> Result<ShapeDescription, BuildError>;
}

/// Coarse fallback: one box around every solid voxel. Used when a full
/// build fails so the cell never loses collision entirely.
pub fn placeholder_shape(snapshot: &VoxelSnapshot) -> ShapeDescription {
    let mut out = ShapeDescription::empty(snapshot.coord, snapshot.size);
    if snapshot.voxels.len() != snapshot.size.pow(3) || snapshot.size > usize::from(u16::MAX) {
        let s = snapshot.size.min(usize::from(u16::MAX)) as u16;
        if s > 0 {
            out.boxes.push(ShapeBox {
                min: [0; 3],
                max: [s; 3],
            });
        }
        return out;
    }
    if let Some((lo, hi)) = snapshot.solid_bounds() {
        out.boxes.push(ShapeBox {
            min: lo.map(|v| v as u16),
            max: hi.map(|v| v as u16 + 1),
        });
    }
    out
}
