use core::num::NonZeroU64;

/// Build lifecycle of a terrain cell. Activation is tracked separately.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellState {
    /// No shape and no pending work.
    Unloaded = 0,
    /// A generation claim was accepted; waiting on a world snapshot.
    Scheduled = 1,
    /// Snapshot taken; a worker is building the shape.
    Generating = 2,
    /// A build has been installed (possibly a placeholder).
    Ready = 3,
    /// Terminal; the slot is being released.
    Removing = 4,
}

impl CellState {
    #[inline]
    pub(crate) const fn from_u8(v: u8) -> CellState {
        match v {
            0 => CellState::Unloaded,
            1 => CellState::Scheduled,
            2 => CellState::Generating,
            3 => CellState::Ready,
            _ => CellState::Removing,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True while a generation attempt owns the cell.
    #[inline]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, CellState::Scheduled | CellState::Generating)
    }

    #[inline]
    pub const fn accepts_claim(self) -> bool {
        matches!(self, CellState::Unloaded | CellState::Ready)
    }
}

/// Opaque id of a collision shape living inside the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeHandle(NonZeroU64);

impl ShapeHandle {
    /// `None` for the reserved "no shape" value 0.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(ShapeHandle(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub(crate) fn raw(h: Option<ShapeHandle>) -> u64 {
        h.map_or(0, ShapeHandle::get)
    }
}

impl core::fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
