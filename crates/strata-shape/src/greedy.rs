use strata_cell::VoxelSnapshot;

use crate::{BuildError, BuildScratch, ShapeBox, ShapeBuilder, ShapeDescription};

pub const DEFAULT_MAX_BOXES: usize = 512;

/// Greedy box decomposition: grow each unclaimed solid voxel along x, then z,
/// then y while the swept face stays solid and unclaimed.
#[derive(Clone, Copy, Debug)]
pub struct BoxMergeBuilder {
    pub max_boxes: usize,
}

impl Default for BoxMergeBuilder {
    fn default() -> Self {
        Self {
            max_boxes: DEFAULT_MAX_BOXES,
        }
    }
}

impl BoxMergeBuilder {
    pub fn new(max_boxes: usize) -> Self {
        Self {
            max_boxes: max_boxes.max(1),
        }
    }
}

impl ShapeBuilder for BoxMergeBuilder {
    fn build(
        &self,
        snap: &VoxelSnapshot,
        scratch: &mut BuildScratch,
    ) -> Result<ShapeDescription, BuildError> {
        let n = snap.size;
        if n == 0 {
            return Err(BuildError::Degenerate {
                cell: snap.coord,
                reason: "zero-sized cell",
            });
        }
        if n > usize::from(u16::MAX) {
            return Err(BuildError::Degenerate {
                cell: snap.coord,
                reason: "cell larger than box coordinate range",
            });
        }
        if snap.voxels.len() != n * n * n {
            return Err(BuildError::Degenerate {
                cell: snap.coord,
                reason: "voxel count does not match cell size",
            });
        }

        scratch.reset(snap.voxels.len());
        let mut out = ShapeDescription::empty(snap.coord, n);
        let open = |used: &[bool], x: usize, y: usize, z: usize| {
            let i = snap.idx(x, y, z);
            snap.voxels[i].is_solid() && !used[i]
        };

        for y in 0..n {
            for z in 0..n {
                for x in 0..n {
                    if !open(&scratch.consumed, x, y, z) {
                        continue;
                    }
                    let mut x1 = x + 1;
                    while x1 < n && open(&scratch.consumed, x1, y, z) {
                        x1 += 1;
                    }
                    let mut z1 = z + 1;
                    while z1 < n && (x..x1).all(|xx| open(&scratch.consumed, xx, y, z1)) {
                        z1 += 1;
                    }
                    let mut y1 = y + 1;
                    while y1 < n
                        && (z..z1).all(|zz| (x..x1).all(|xx| open(&scratch.consumed, xx, y1, zz)))
                    {
                        y1 += 1;
                    }
                    for yy in y..y1 {
                        for zz in z..z1 {
                            for xx in x..x1 {
                                let i = snap.idx(xx, yy, zz);
                                scratch.consumed[i] = true;
                            }
                        }
                    }
                    if out.boxes.len() == self.max_boxes {
                        return Err(BuildError::TooManyBoxes {
                            cell: snap.coord,
                            limit: self.max_boxes,
                        });
                    }
                    out.boxes.push(ShapeBox {
                        min: [x as u16, y as u16, z as u16],
                        max: [x1 as u16, y1 as u16, z1 as u16],
                    });
                }
            }
        }
        Ok(out)
    }
}
