use strata_geom::{Aabb, Vec3};

use crate::CellCoord;

/// Maps world voxel positions onto cubic cells of `size` voxels per edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellGrid {
    size: i32,
}

impl CellGrid {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            size: size.max(1) as i32,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn cell_of(&self, wx: i32, wy: i32, wz: i32) -> CellCoord {
        CellCoord::new(
            wx.div_euclid(self.size),
            wy.div_euclid(self.size),
            wz.div_euclid(self.size),
        )
    }

    /// World voxel position of the cell's minimum corner.
    #[inline]
    pub fn origin(&self, c: CellCoord) -> (i32, i32, i32) {
        (c.cx * self.size, c.cy * self.size, c.cz * self.size)
    }

    pub fn bounds(&self, c: CellCoord) -> Aabb {
        let (x0, y0, z0) = self.origin(c);
        let s = self.size as f32;
        let min = Vec3::new(x0 as f32, y0 as f32, z0 as f32);
        Aabb::new(min, min + Vec3::splat(s))
    }

    /// Every cell whose volume overlaps `bb` (inclusive of touching faces),
    /// or `None` when `bb` is not finite or covers more than `limit` cells.
    pub fn cells_overlapping(&self, bb: &Aabb, limit: usize) -> Option<Vec<CellCoord>> {
        if !bb.is_finite() {
            return None;
        }
        let s = self.size as f32;
        let idx = |v: f32| (v / s).floor() as i32;
        let (x0, x1) = (idx(bb.min.x), idx(bb.max.x));
        let (y0, y1) = (idx(bb.min.y), idx(bb.max.y));
        let (z0, z1) = (idx(bb.min.z), idx(bb.max.z));
        let span = |lo: i32, hi: i32| (i64::from(hi) - i64::from(lo) + 1).max(0) as u64;
        let count = span(x0, x1)
            .checked_mul(span(y0, y1))
            .and_then(|n| n.checked_mul(span(z0, z1)))?;
        if count > limit as u64 {
            return None;
        }
        let mut out = Vec::with_capacity(count as usize);
        for cy in y0..=y1 {
            for cz in z0..=z1 {
                for cx in x0..=x1 {
                    out.push(CellCoord::new(cx, cy, cz));
                }
            }
        }
        Some(out)
    }

    /// Cells whose geometry can change when the voxel at a world position
    /// changes: the owning cell, plus each neighbour across a face, edge or
    /// corner the voxel sits on.
    pub fn affected_cells(&self, wx: i32, wy: i32, wz: i32) -> Vec<CellCoord> {
        let home = self.cell_of(wx, wy, wz);
        let (x0, y0, z0) = self.origin(home);
        let border = |local: i32| -> &'static [i32] {
            if local == 0 {
                &[0, -1]
            } else if local == self.size - 1 {
                &[0, 1]
            } else {
                &[0]
            }
        };
        let (ox, oy, oz) = (border(wx - x0), border(wy - y0), border(wz - z0));

        let mut affected = Vec::with_capacity(ox.len() * oy.len() * oz.len());
        affected.push(home);
        for &dx in ox {
            for &dy in oy {
                for &dz in oz {
                    if dx == 0 && dy == 0 && dz == 0 {
                        continue;
                    }
                    affected.push(home.offset(dx, dy, dz));
                }
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_of_floors_negative_positions() {
        let g = CellGrid::new(16);
        assert_eq!(g.cell_of(0, 0, 0), CellCoord::new(0, 0, 0));
        assert_eq!(g.cell_of(-1, 15, 16), CellCoord::new(-1, 0, 1));
        assert_eq!(g.cell_of(-16, -17, 31), CellCoord::new(-1, -2, 1));
    }

    #[test]
    fn interior_edit_affects_one_cell() {
        let g = CellGrid::new(16);
        assert_eq!(g.affected_cells(5, 5, 5), vec![CellCoord::new(0, 0, 0)]);
    }

    #[test]
    fn face_edit_marks_neighbor_only_on_that_side() {
        let g = CellGrid::new(16);
        let mut top = g.affected_cells(3, 15, 7);
        top.sort();
        assert_eq!(top, vec![CellCoord::new(0, 0, 0), CellCoord::new(0, 1, 0)]);
        let mut west = g.affected_cells(16, 4, 4);
        west.sort();
        assert_eq!(west, vec![CellCoord::new(0, 0, 0), CellCoord::new(1, 0, 0)]);
    }

    #[test]
    fn corner_edit_marks_all_seven_neighbors() {
        let g = CellGrid::new(8);
        let affected = g.affected_cells(0, 0, 0);
        assert_eq!(affected.len(), 8);
        assert!(affected.contains(&CellCoord::new(-1, -1, -1)));
    }

    #[test]
    fn overlapping_cells_cover_box() {
        let g = CellGrid::new(16);
        let bb = Aabb::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::new(17.0, 1.0, 1.0));
        let cells = g.cells_overlapping(&bb, 64).unwrap();
        assert_eq!(
            cells,
            vec![
                CellCoord::new(-1, 0, 0),
                CellCoord::new(0, 0, 0),
                CellCoord::new(1, 0, 0),
            ]
        );
    }

    #[test]
    fn oversized_box_is_refused_without_overflow() {
        let g = CellGrid::new(16);
        let huge = Aabb::new(Vec3::splat(-1e9), Vec3::splat(1e9));
        assert!(g.cells_overlapping(&huge, usize::MAX).is_none());

        let bb = Aabb::new(Vec3::ZERO, Vec3::splat(47.0));
        assert!(g.cells_overlapping(&bb, 26).is_none());
        assert_eq!(g.cells_overlapping(&bb, 27).map(|c| c.len()), Some(27));
    }

    #[test]
    fn non_finite_box_overlaps_nothing() {
        let g = CellGrid::new(16);
        let bb = Aabb::new(Vec3::ZERO, Vec3::new(f32::INFINITY, 1.0, 1.0));
        assert!(g.cells_overlapping(&bb, usize::MAX).is_none());
    }
}
