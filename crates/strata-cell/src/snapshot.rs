use serde::{Deserialize, Serialize};

use crate::{CellCoord, CellKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Voxel(pub u16);

impl Voxel {
    pub const AIR: Voxel = Voxel(0);

    #[inline]
    pub fn is_solid(self) -> bool {
        self.0 != 0
    }
}

/// Owned copy of one cell's voxels. Holds no reference back into the world,
/// so it can cross threads freely.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelSnapshot {
    pub coord: CellCoord,
    pub size: usize,
    pub voxels: Vec<Voxel>,
}

impl VoxelSnapshot {
    /// Build from a y-major, then z, then x voxel array. A wrong-length array
    /// is padded with air or truncated.
    pub fn from_voxels(coord: CellCoord, size: usize, voxels: Vec<Voxel>) -> Self {
        let mut v = voxels;
        let expect = size * size * size;
        if v.len() != expect {
            v.resize(expect, Voxel::AIR);
        }
        Self {
            coord,
            size,
            voxels: v,
        }
    }

    pub fn filled(coord: CellCoord, size: usize, voxel: Voxel) -> Self {
        Self {
            coord,
            size,
            voxels: vec![voxel; size * size * size],
        }
    }

    #[inline]
    pub fn key(&self) -> CellKey {
        self.coord.key()
    }

    #[inline]
    pub fn idx(&self, x: usize, y: usize, z: usize) -> usize {
        (y * self.size + z) * self.size + x
    }

    #[inline]
    pub fn get_local(&self, x: usize, y: usize, z: usize) -> Voxel {
        self.voxels[self.idx(x, y, z)]
    }

    #[inline]
    pub fn set_local(&mut self, x: usize, y: usize, z: usize, v: Voxel) {
        let i = self.idx(x, y, z);
        self.voxels[i] = v;
    }

    #[inline]
    pub fn is_solid_local(&self, x: usize, y: usize, z: usize) -> bool {
        self.get_local(x, y, z).is_solid()
    }

    pub fn solid_count(&self) -> usize {
        self.voxels.iter().filter(|v| v.is_solid()).count()
    }

    #[inline]
    pub fn is_all_air(&self) -> bool {
        !self.voxels.iter().any(|v| v.is_solid())
    }

    /// Inclusive local bounds of the solid voxels, or `None` for an all-air cell.
    pub fn solid_bounds(&self) -> Option<([usize; 3], [usize; 3])> {
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut any = false;
        for y in 0..self.size {
            for z in 0..self.size {
                for x in 0..self.size {
                    if !self.is_solid_local(x, y, z) {
                        continue;
                    }
                    any = true;
                    lo = [lo[0].min(x), lo[1].min(y), lo[2].min(z)];
                    hi = [hi[0].max(x), hi[1].max(y), hi[2].max(z)];
                }
            }
        }
        any.then_some((lo, hi))
    }
}
