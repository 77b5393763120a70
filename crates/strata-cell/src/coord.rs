use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub cx: i32,
    pub cy: i32,
    pub cz: i32,
}

impl CellCoord {
    #[inline]
    pub const fn new(cx: i32, cy: i32, cz: i32) -> Self {
        Self { cx, cy, cz }
    }

    #[inline]
    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            cx: self.cx + dx,
            cy: self.cy + dy,
            cz: self.cz + dz,
        }
    }

    #[inline]
    pub fn distance_sq(self, other: CellCoord) -> i64 {
        let dx = i64::from(self.cx - other.cx);
        let dy = i64::from(self.cy - other.cy);
        let dz = i64::from(self.cz - other.cz);
        dx * dx + dy * dy + dz * dz
    }

    #[inline]
    pub fn key(self) -> CellKey {
        CellKey::pack(self)
    }
}

impl From<(i32, i32, i32)> for CellCoord {
    fn from(value: (i32, i32, i32)) -> Self {
        Self::new(value.0, value.1, value.2)
    }
}

impl From<CellCoord> for (i32, i32, i32) {
    fn from(value: CellCoord) -> Self {
        (value.cx, value.cy, value.cz)
    }
}

const XZ_BITS: u32 = 22;
const Y_BITS: u32 = 20;
const XZ_MASK: u64 = (1 << XZ_BITS) - 1;
const Y_MASK: u64 = (1 << Y_BITS) - 1;
const X_SHIFT: u32 = Y_BITS + XZ_BITS;
const Z_SHIFT: u32 = Y_BITS;

/// A cell coordinate packed into 64 bits: 22 bits x, 22 bits z, 20 bits y,
/// each two's complement. Packing is bijective for coordinates inside
/// [`CellKey::XZ_RANGE`] / [`CellKey::Y_RANGE`]; wider values wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey(pub u64);

impl CellKey {
    pub const XZ_RANGE: core::ops::Range<i32> = -(1 << (XZ_BITS - 1))..(1 << (XZ_BITS - 1));
    pub const Y_RANGE: core::ops::Range<i32> = -(1 << (Y_BITS - 1))..(1 << (Y_BITS - 1));

    #[inline]
    pub const fn pack(c: CellCoord) -> Self {
        let x = (c.cx as i64 as u64) & XZ_MASK;
        let y = (c.cy as i64 as u64) & Y_MASK;
        let z = (c.cz as i64 as u64) & XZ_MASK;
        CellKey((x << X_SHIFT) | (z << Z_SHIFT) | y)
    }

    #[inline]
    pub const fn coord(self) -> CellCoord {
        let raw = self.0 as i64;
        let cx = (raw >> X_SHIFT) as i32;
        let cz = ((raw << XZ_BITS) >> (XZ_BITS + Z_SHIFT)) as i32;
        let cy = ((raw << (64 - Y_BITS)) >> (64 - Y_BITS)) as i32;
        CellCoord { cx, cy, cz }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<CellCoord> for CellKey {
    fn from(value: CellCoord) -> Self {
        CellKey::pack(value)
    }
}

impl From<CellKey> for CellCoord {
    fn from(value: CellKey) -> Self {
        value.coord()
    }
}

impl core::fmt::Display for CellKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let c = self.coord();
        write!(f, "({}, {}, {})", c.cx, c.cy, c.cz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_packs_to_zero() {
        assert_eq!(CellKey::pack(CellCoord::new(0, 0, 0)).raw(), 0);
    }

    #[test]
    fn negative_axes_survive_unpack() {
        let c = CellCoord::new(-1, -1, -1);
        assert_eq!(c.key().coord(), c);
        let c = CellCoord::new(-(1 << 21), -(1 << 19), (1 << 21) - 1);
        assert_eq!(c.key().coord(), c);
    }

    #[test]
    fn axes_do_not_bleed() {
        let x = CellCoord::new(5, 0, 0).key();
        let y = CellCoord::new(0, 5, 0).key();
        let z = CellCoord::new(0, 0, 5).key();
        assert_ne!(x, y);
        assert_ne!(y, z);
        assert_ne!(x, z);
    }
}
