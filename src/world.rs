use fastnoise_lite::{FastNoiseLite, NoiseType};
use hashbrown::HashMap;
use strata_cell::{CellCoord, CellGrid, CellKey, Voxel, VoxelSnapshot};
use strata_sched::{SnapshotError, SnapshotProvider};

pub const STONE: Voxel = Voxel(1);
pub const DIRT: Voxel = Voxel(2);

const TOPSOIL: i32 = 3;

/// Heightmap terrain with sparse edits layered on top. Only cells within
/// `extent` cells of the origin on x and z count as loaded.
pub struct NoiseWorld {
    grid: CellGrid,
    terrain: FastNoiseLite,
    base_height: i32,
    amplitude: f32,
    extent: i32,
    edits: HashMap<(i32, i32, i32), Voxel>,
    pub snapshots: u64,
}

impl NoiseWorld {
    pub fn new(grid: CellGrid, seed: i32, extent: i32) -> Self {
        let mut terrain = FastNoiseLite::with_seed(seed);
        terrain.set_noise_type(Some(NoiseType::OpenSimplex2));
        terrain.set_frequency(Some(0.02));
        Self {
            grid,
            terrain,
            base_height: grid.size() as i32,
            amplitude: grid.size() as f32 * 0.75,
            extent: extent.max(0),
            edits: HashMap::new(),
            snapshots: 0,
        }
    }

    pub fn height_at(&self, wx: i32, wz: i32) -> i32 {
        let h = self.terrain.get_noise_2d(wx as f32, wz as f32);
        self.base_height + (h * self.amplitude) as i32
    }

    pub fn voxel(&self, wx: i32, wy: i32, wz: i32) -> Voxel {
        if let Some(&v) = self.edits.get(&(wx, wy, wz)) {
            return v;
        }
        self.generated(wx, wy, wz, self.height_at(wx, wz))
    }

    fn generated(&self, _wx: i32, wy: i32, _wz: i32, height: i32) -> Voxel {
        if wy >= height {
            Voxel::AIR
        } else if wy >= height - TOPSOIL {
            DIRT
        } else {
            STONE
        }
    }

    /// Returns the previous voxel.
    pub fn set_voxel(&mut self, wx: i32, wy: i32, wz: i32, v: Voxel) -> Voxel {
        let prev = self.voxel(wx, wy, wz);
        self.edits.insert((wx, wy, wz), v);
        prev
    }

    pub fn is_loaded(&self, c: CellCoord) -> bool {
        c.cx.abs() <= self.extent && c.cz.abs() <= self.extent
    }
}

impl SnapshotProvider for NoiseWorld {
    fn snapshot(&mut self, key: CellKey) -> Result<VoxelSnapshot, SnapshotError> {
        let coord = key.coord();
        if !self.is_loaded(coord) {
            return Err(SnapshotError::NotLoaded(key));
        }
        let n = self.grid.size();
        let (x0, y0, z0) = self.grid.origin(coord);
        let mut heights = Vec::with_capacity(n * n);
        for z in 0..n as i32 {
            for x in 0..n as i32 {
                heights.push(self.height_at(x0 + x, z0 + z));
            }
        }
        let mut voxels = Vec::with_capacity(n * n * n);
        for y in 0..n as i32 {
            for z in 0..n as i32 {
                for x in 0..n as i32 {
                    let (wx, wy, wz) = (x0 + x, y0 + y, z0 + z);
                    let v = match self.edits.get(&(wx, wy, wz)) {
                        Some(&v) => v,
                        None => self.generated(wx, wy, wz, heights[z as usize * n + x as usize]),
                    };
                    voxels.push(v);
                }
            }
        }
        self.snapshots += 1;
        Ok(VoxelSnapshot::from_voxels(coord, n, voxels))
    }
}
