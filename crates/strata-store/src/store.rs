use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use dashmap::DashMap;
use strata_cell::CellKey;

use crate::{CellState, ShapeHandle, StoreError};

pub type CellIndex = u32;

const PAGE_BITS: u32 = 6;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: usize = PAGE_SIZE - 1;

pub const DEFAULT_INITIAL_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CELLS: usize = 1 << 20;

/// One fixed block of slots. Pages are allocated on growth and never move,
/// so readers holding a page reference never observe a resize.
struct CellPage {
    live: Box<[AtomicBool]>,
    key: Box<[AtomicU64]>,
    state: Box<[AtomicU8]>,
    active: Box<[AtomicBool]>,
    placeholder: Box<[AtomicBool]>,
    shape: Box<[AtomicU64]>,
    version: Box<[AtomicU32]>,
    ref_count: Box<[AtomicU32]>,
}

fn column<T>(init: impl Fn() -> T) -> Box<[T]> {
    (0..PAGE_SIZE).map(|_| init()).collect()
}

impl CellPage {
    fn new() -> Self {
        Self {
            live: column(|| AtomicBool::new(false)),
            key: column(|| AtomicU64::new(0)),
            state: column(|| AtomicU8::new(CellState::Unloaded.as_u8())),
            active: column(|| AtomicBool::new(false)),
            placeholder: column(|| AtomicBool::new(true)),
            shape: column(|| AtomicU64::new(0)),
            version: column(|| AtomicU32::new(0)),
            ref_count: column(|| AtomicU32::new(0)),
        }
    }
}

struct Allocator {
    free: Vec<CellIndex>,
    next: CellIndex,
}

/// Point-in-time copy of one slot's columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRecord {
    pub key: CellKey,
    pub state: CellState,
    pub shape: Option<ShapeHandle>,
    pub placeholder: bool,
    pub active: bool,
    pub rebuild_version: u32,
    pub ref_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub live: usize,
    pub capacity: usize,
    pub free_slots: usize,
    pub unloaded: usize,
    pub scheduled: usize,
    pub generating: usize,
    pub ready: usize,
    pub removing: usize,
    pub active: usize,
    pub with_shape: usize,
}

/// Slot released by [`TerrainCellStore::remove_cell`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemovedCell {
    pub index: CellIndex,
    /// Shape the slot owned; the caller must release it in the simulation.
    pub shape: Option<ShapeHandle>,
}

/// Why a finished build was not installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallRejected {
    /// The slot no longer holds the cell the build was made for.
    Evicted,
    /// A newer generation attempt superseded this one.
    Stale { version: u32, current: u32 },
    /// The cell is not in the generating state.
    NotGenerating(CellState),
}

/// Structure-of-arrays store of terrain cells.
///
/// Slot allocation and release go through one allocation lock; every per-slot
/// read and write is a single atomic operation. Reads of an index outside the
/// allocated range return defaults (`Removing`, no shape, zero counts) since
/// removal can race with readers.
///
/// The key index is a sharded `DashMap`. A lookup takes one shard's read lock
/// for the duration of one hash lookup and never waits on the allocation lock,
/// so the `add_cell` fast path and `index_of` keep running while another
/// thread allocates or grows. Lock order is allocation lock, then shard; no
/// shard guard is held while the allocation lock is taken.
pub struct TerrainCellStore {
    pages: Box<[OnceLock<Box<CellPage>>]>,
    capacity: AtomicUsize,
    max_cells: usize,
    index: DashMap<CellKey, CellIndex>,
    alloc: Mutex<Allocator>,
}

/// Install shape and placeholder flag, then move `Generating -> Ready`. Both
/// are put back if the state moved on.
fn swap_in_build(
    page: &CellPage,
    i: usize,
    shape: Option<ShapeHandle>,
    placeholder: bool,
) -> Result<Option<ShapeHandle>, InstallRejected> {
    let previous = ShapeHandle::new(page.shape[i].swap(ShapeHandle::raw(shape), Ordering::AcqRel));
    let was_placeholder = page.placeholder[i].swap(placeholder, Ordering::AcqRel);
    if let Err(actual) = page.state[i].compare_exchange(
        CellState::Generating.as_u8(),
        CellState::Ready.as_u8(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        page.shape[i].store(ShapeHandle::raw(previous), Ordering::Release);
        page.placeholder[i].store(was_placeholder, Ordering::Release);
        return Err(InstallRejected::NotGenerating(CellState::from_u8(actual)));
    }
    Ok(previous)
}

impl Default for TerrainCellStore {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn round_to_page(n: usize) -> usize {
    n.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE
}

impl TerrainCellStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CELLS)
    }

    /// `initial` and `max_cells` are rounded up to whole pages.
    pub fn with_limits(initial: usize, max_cells: usize) -> Self {
        let max_cells = round_to_page(max_cells).min(CellIndex::MAX as usize + 1);
        let initial = round_to_page(initial).min(max_cells);
        let pages: Box<[OnceLock<Box<CellPage>>]> =
            (0..max_cells / PAGE_SIZE).map(|_| OnceLock::new()).collect();
        for page in pages.iter().take(initial / PAGE_SIZE) {
            let _ = page.set(Box::new(CellPage::new()));
        }
        Self {
            pages,
            capacity: AtomicUsize::new(initial),
            max_cells,
            index: DashMap::new(),
            alloc: Mutex::new(Allocator {
                free: Vec::new(),
                next: 0,
            }),
        }
    }

    #[inline]
    fn slot(&self, index: CellIndex) -> Option<(&CellPage, usize)> {
        let i = index as usize;
        if i >= self.capacity.load(Ordering::Acquire) {
            return None;
        }
        let page = self.pages.get(i >> PAGE_BITS)?.get()?;
        Some((page, i & PAGE_MASK))
    }

    #[inline]
    fn live_slot(&self, index: CellIndex) -> Option<(&CellPage, usize)> {
        self.slot(index)
            .filter(|(page, i)| page.live[*i].load(Ordering::Acquire))
    }

    fn lock_alloc(&self) -> MutexGuard<'_, Allocator> {
        self.alloc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn index_of(&self, key: CellKey) -> Option<CellIndex> {
        self.index.get(&key).map(|e| *e.value())
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Slot for `key`, allocating and resetting one if the key is new.
    pub fn add_cell(&self, key: CellKey) -> Result<CellIndex, StoreError> {
        if let Some(i) = self.index_of(key) {
            return Ok(i);
        }
        let mut alloc = self.lock_alloc();
        if let Some(i) = self.index_of(key) {
            return Ok(i);
        }
        let index = match alloc.free.pop() {
            Some(i) => i,
            None => {
                if alloc.next as usize >= self.capacity() {
                    self.grow()?;
                }
                let i = alloc.next;
                alloc.next += 1;
                i
            }
        };
        self.reset_slot(index, key);
        self.index.insert(key, index);
        Ok(index)
    }

    /// Raise capacity by half (at least one page). Caller holds the allocation lock.
    fn grow(&self) -> Result<(), StoreError> {
        let cap = self.capacity();
        if cap >= self.max_cells {
            log::error!("terrain cell store exhausted at {} slots", cap);
            return Err(StoreError::CapacityExhausted { capacity: cap });
        }
        let target = round_to_page((cap + cap / 2).max(cap + 1)).min(self.max_cells);
        for page in &self.pages[cap / PAGE_SIZE..target / PAGE_SIZE] {
            page.get_or_init(|| Box::new(CellPage::new()));
        }
        self.capacity.store(target, Ordering::Release);
        log::debug!("terrain cell store grew {} -> {}", cap, target);
        Ok(())
    }

    /// Rebuild versions are left untouched so results aimed at the slot's
    /// previous tenant stay stale.
    fn reset_slot(&self, index: CellIndex, key: CellKey) {
        let Some((page, i)) = self.slot(index) else {
            return;
        };
        page.key[i].store(key.raw(), Ordering::Relaxed);
        page.state[i].store(CellState::Unloaded.as_u8(), Ordering::Relaxed);
        page.active[i].store(false, Ordering::Relaxed);
        page.placeholder[i].store(true, Ordering::Relaxed);
        page.shape[i].store(0, Ordering::Relaxed);
        page.ref_count[i].store(0, Ordering::Relaxed);
        page.live[i].store(true, Ordering::Release);
    }

    /// Unmap `key`, take the slot's shape and return the index to the free list.
    pub fn remove_cell(&self, key: CellKey) -> Option<RemovedCell> {
        let mut alloc = self.lock_alloc();
        let (_, index) = self.index.remove(&key)?;
        let Some((page, i)) = self.slot(index) else {
            return Some(RemovedCell { index, shape: None });
        };
        page.state[i].store(CellState::Removing.as_u8(), Ordering::Release);
        page.version[i].fetch_add(1, Ordering::AcqRel);
        page.live[i].store(false, Ordering::Release);
        page.active[i].store(false, Ordering::Relaxed);
        page.ref_count[i].store(0, Ordering::Relaxed);
        let shape = ShapeHandle::new(page.shape[i].swap(0, Ordering::AcqRel));
        alloc.free.push(index);
        Some(RemovedCell { index, shape })
    }

    /// Claim the cell for a new generation attempt.
    ///
    /// Succeeds only from `Unloaded` or `Ready`; the state moves to
    /// `Scheduled` and the bumped rebuild version is returned. Any number of
    /// threads may race here, at most one claim is outstanding per cell.
    pub fn schedule_for_generation(&self, index: CellIndex) -> Option<u32> {
        let (page, i) = self.live_slot(index)?;
        let state = &page.state[i];
        let mut cur = state.load(Ordering::Acquire);
        loop {
            if !CellState::from_u8(cur).accepts_claim() {
                return None;
            }
            match state.compare_exchange_weak(
                cur,
                CellState::Scheduled.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(page.version[i].fetch_add(1, Ordering::AcqRel) + 1),
                Err(actual) => cur = actual,
            }
        }
    }

    /// `Scheduled -> Generating` for the holder of the current claim.
    pub fn begin_generation(&self, index: CellIndex, version: u32) -> bool {
        let Some((page, i)) = self.live_slot(index) else {
            return false;
        };
        if page.version[i].load(Ordering::Acquire) != version {
            return false;
        }
        page.state[i]
            .compare_exchange(
                CellState::Scheduled.as_u8(),
                CellState::Generating.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Give up an in-flight claim without a result. The cell returns to
    /// `Ready` if it has ever completed a build, else to `Unloaded`.
    pub fn abandon_generation(&self, index: CellIndex, version: u32) -> bool {
        let Some((page, i)) = self.live_slot(index) else {
            return false;
        };
        if page.version[i].load(Ordering::Acquire) != version {
            return false;
        }
        let fallback = if page.shape[i].load(Ordering::Acquire) != 0
            || !page.placeholder[i].load(Ordering::Acquire)
        {
            CellState::Ready
        } else {
            CellState::Unloaded
        };
        let state = &page.state[i];
        let mut cur = state.load(Ordering::Acquire);
        loop {
            if !CellState::from_u8(cur).is_in_flight() {
                return false;
            }
            match state.compare_exchange_weak(
                cur,
                fallback.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Check whether a build for `(index, key, version)` may be installed.
    pub fn check_install(
        &self,
        index: CellIndex,
        key: CellKey,
        version: u32,
    ) -> Result<(), InstallRejected> {
        let Some((page, i)) = self.live_slot(index) else {
            return Err(InstallRejected::Evicted);
        };
        if page.key[i].load(Ordering::Acquire) != key.raw() {
            return Err(InstallRejected::Evicted);
        }
        let current = page.version[i].load(Ordering::Acquire);
        if version != current {
            return Err(InstallRejected::Stale { version, current });
        }
        match CellState::from_u8(page.state[i].load(Ordering::Acquire)) {
            CellState::Generating => Ok(()),
            other => Err(InstallRejected::NotGenerating(other)),
        }
    }

    /// Swap in a finished build and move `Generating -> Ready`.
    ///
    /// Returns the shape it replaced. On rejection nothing is changed and the
    /// caller still owns `shape`.
    pub fn finish_generation(
        &self,
        index: CellIndex,
        key: CellKey,
        version: u32,
        shape: Option<ShapeHandle>,
        placeholder: bool,
    ) -> Result<Option<ShapeHandle>, InstallRejected> {
        self.check_install(index, key, version)?;
        let Some((page, i)) = self.live_slot(index) else {
            return Err(InstallRejected::Evicted);
        };
        swap_in_build(page, i, shape, placeholder)
    }

    /// Mark an unreferenced, idle cell `Removing`. Fails if references exist
    /// or a generation attempt is in flight.
    pub fn try_begin_removal(&self, index: CellIndex) -> bool {
        let Some((page, i)) = self.live_slot(index) else {
            return false;
        };
        if page.ref_count[i].load(Ordering::Acquire) != 0 {
            return false;
        }
        let state = &page.state[i];
        let mut cur = state.load(Ordering::Acquire);
        loop {
            match CellState::from_u8(cur) {
                CellState::Removing => return true,
                s if s.is_in_flight() => return false,
                _ => {}
            }
            match state.compare_exchange_weak(
                cur,
                CellState::Removing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if page.ref_count[i].load(Ordering::Acquire) != 0 {
            state.store(cur, Ordering::Release);
            return false;
        }
        true
    }

    #[inline]
    pub fn is_version_stale(&self, index: CellIndex, version: u32) -> bool {
        match self.slot(index) {
            Some((page, i)) => version < page.version[i].load(Ordering::Acquire),
            None => true,
        }
    }

    /// Post-increment count; `Some(1)` marks the 0 -> 1 edge.
    pub fn increment_ref_count(&self, index: CellIndex) -> Option<u32> {
        let (page, i) = self.live_slot(index)?;
        Some(page.ref_count[i].fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Post-decrement count, saturating at zero; `Some(0)` marks the 1 -> 0 edge.
    pub fn decrement_ref_count(&self, index: CellIndex) -> Option<u32> {
        let (page, i) = self.live_slot(index)?;
        let prev = page.ref_count[i]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .unwrap_or(0);
        Some(prev.saturating_sub(1))
    }

    /// Returns true if the flag changed.
    pub fn set_active(&self, index: CellIndex, active: bool) -> bool {
        match self.live_slot(index) {
            Some((page, i)) => page.active[i].swap(active, Ordering::AcqRel) != active,
            None => false,
        }
    }

    #[inline]
    pub fn state(&self, index: CellIndex) -> CellState {
        self.slot(index)
            .map_or(CellState::Removing, |(page, i)| {
                CellState::from_u8(page.state[i].load(Ordering::Acquire))
            })
    }

    #[inline]
    pub fn shape_handle(&self, index: CellIndex) -> Option<ShapeHandle> {
        self.live_slot(index)
            .and_then(|(page, i)| ShapeHandle::new(page.shape[i].load(Ordering::Acquire)))
    }

    #[inline]
    pub fn is_placeholder(&self, index: CellIndex) -> bool {
        self.slot(index)
            .is_none_or(|(page, i)| page.placeholder[i].load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self, index: CellIndex) -> bool {
        self.live_slot(index)
            .is_some_and(|(page, i)| page.active[i].load(Ordering::Acquire))
    }

    #[inline]
    pub fn rebuild_version(&self, index: CellIndex) -> u32 {
        self.slot(index)
            .map_or(0, |(page, i)| page.version[i].load(Ordering::Acquire))
    }

    #[inline]
    pub fn ref_count(&self, index: CellIndex) -> u32 {
        self.live_slot(index)
            .map_or(0, |(page, i)| page.ref_count[i].load(Ordering::Acquire))
    }

    pub fn key_at(&self, index: CellIndex) -> Option<CellKey> {
        self.live_slot(index)
            .map(|(page, i)| CellKey(page.key[i].load(Ordering::Acquire)))
    }

    pub fn record(&self, index: CellIndex) -> Option<CellRecord> {
        let (page, i) = self.live_slot(index)?;
        Some(CellRecord {
            key: CellKey(page.key[i].load(Ordering::Acquire)),
            state: CellState::from_u8(page.state[i].load(Ordering::Acquire)),
            shape: ShapeHandle::new(page.shape[i].load(Ordering::Acquire)),
            placeholder: page.placeholder[i].load(Ordering::Acquire),
            active: page.active[i].load(Ordering::Acquire),
            rebuild_version: page.version[i].load(Ordering::Acquire),
            ref_count: page.ref_count[i].load(Ordering::Acquire),
        })
    }

    /// A cell is ready when it holds a completed, non-placeholder build.
    pub fn is_section_ready(&self, key: CellKey) -> bool {
        let Some(index) = self.index_of(key) else {
            return false;
        };
        match self.record(index) {
            Some(r) => r.key == key && r.state != CellState::Removing && !r.placeholder,
            None => false,
        }
    }

    /// Linear scan over allocated slots; intended for diagnostics.
    pub fn stats(&self) -> StoreStats {
        let (next, free_slots) = {
            let alloc = self.lock_alloc();
            (alloc.next, alloc.free.len())
        };
        let mut stats = StoreStats {
            capacity: self.capacity(),
            free_slots,
            ..StoreStats::default()
        };
        for index in 0..next {
            let Some(r) = self.record(index) else {
                continue;
            };
            stats.live += 1;
            match r.state {
                CellState::Unloaded => stats.unloaded += 1,
                CellState::Scheduled => stats.scheduled += 1,
                CellState::Generating => stats.generating += 1,
                CellState::Ready => stats.ready += 1,
                CellState::Removing => stats.removing += 1,
            }
            stats.active += usize::from(r.active);
            stats.with_shape += usize::from(r.shape.is_some());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cell::CellCoord;

    fn key(x: i32, y: i32, z: i32) -> CellKey {
        CellCoord::new(x, y, z).key()
    }

    #[test]
    fn add_is_idempotent_per_key() {
        let store = TerrainCellStore::new();
        let a = store.add_cell(key(0, 0, 0)).unwrap();
        let b = store.add_cell(key(0, 0, 0)).unwrap();
        let c = store.add_cell(key(1, 0, 0)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn fresh_cell_defaults() {
        let store = TerrainCellStore::new();
        let i = store.add_cell(key(3, -2, 9)).unwrap();
        let r = store.record(i).unwrap();
        assert_eq!(r.key, key(3, -2, 9));
        assert_eq!(r.state, CellState::Unloaded);
        assert_eq!(r.shape, None);
        assert!(r.placeholder);
        assert!(!r.active);
        assert_eq!(r.ref_count, 0);
    }

    #[test]
    fn out_of_range_reads_are_safe_defaults() {
        let store = TerrainCellStore::with_limits(64, 128);
        assert_eq!(store.state(10_000), CellState::Removing);
        assert_eq!(store.shape_handle(10_000), None);
        assert!(store.is_placeholder(10_000));
        assert!(store.is_version_stale(10_000, u32::MAX));
        assert_eq!(store.schedule_for_generation(10_000), None);
        assert_eq!(store.increment_ref_count(10_000), None);
        // Allocated range but never handed out.
        assert_eq!(store.schedule_for_generation(5), None);
    }

    #[test]
    fn claim_rejected_while_in_flight() {
        let store = TerrainCellStore::new();
        let i = store.add_cell(key(0, 0, 0)).unwrap();
        assert_eq!(store.schedule_for_generation(i), Some(1));
        assert_eq!(store.schedule_for_generation(i), None);
        assert!(store.begin_generation(i, 1));
        assert_eq!(store.state(i), CellState::Generating);
        assert_eq!(store.schedule_for_generation(i), None);
    }

    #[test]
    fn begin_generation_requires_current_version() {
        let store = TerrainCellStore::new();
        let i = store.add_cell(key(0, 0, 0)).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        assert!(!store.begin_generation(i, v + 1));
        assert!(!store.begin_generation(i, v - 1));
        assert!(store.begin_generation(i, v));
        assert!(!store.begin_generation(i, v));
    }

    #[test]
    fn finish_swaps_shape_and_reports_previous() {
        let store = TerrainCellStore::new();
        let k = key(0, 0, 0);
        let i = store.add_cell(k).unwrap();
        let v1 = store.schedule_for_generation(i).unwrap();
        assert!(store.begin_generation(i, v1));
        let h1 = ShapeHandle::new(11);
        assert_eq!(store.finish_generation(i, k, v1, h1, false), Ok(None));
        assert_eq!(store.state(i), CellState::Ready);

        // Rebuild keeps the old shape until the new one lands.
        let v2 = store.schedule_for_generation(i).unwrap();
        assert_eq!(v2, v1 + 1);
        assert_eq!(store.shape_handle(i), h1);
        assert!(store.begin_generation(i, v2));
        let h2 = ShapeHandle::new(12);
        assert_eq!(store.finish_generation(i, k, v2, h2, false), Ok(h1));
        assert_eq!(store.shape_handle(i), h2);
    }

    #[test]
    fn finish_rejects_wrong_key_and_state() {
        let store = TerrainCellStore::new();
        let k = key(0, 0, 0);
        let i = store.add_cell(k).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        assert_eq!(
            store.finish_generation(i, k, v, ShapeHandle::new(1), false),
            Err(InstallRejected::NotGenerating(CellState::Scheduled))
        );
        assert!(store.begin_generation(i, v));
        assert_eq!(
            store.finish_generation(i, key(9, 9, 9), v, ShapeHandle::new(1), false),
            Err(InstallRejected::Evicted)
        );
        assert_eq!(store.shape_handle(i), None);
    }

    #[test]
    fn lost_install_race_restores_shape_and_placeholder() {
        let store = TerrainCellStore::new();
        let k = key(0, 0, 0);
        let i = store.add_cell(k).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        store.begin_generation(i, v);
        store
            .finish_generation(i, k, v, ShapeHandle::new(5), true)
            .unwrap();
        // The cell left `Generating` after the install check passed.
        store.schedule_for_generation(i).unwrap();

        let (page, slot) = store.live_slot(i).unwrap();
        assert_eq!(
            swap_in_build(page, slot, ShapeHandle::new(6), false),
            Err(InstallRejected::NotGenerating(CellState::Scheduled))
        );
        assert_eq!(store.shape_handle(i), ShapeHandle::new(5));
        assert!(store.is_placeholder(i));
        assert_eq!(store.state(i), CellState::Scheduled);
    }

    #[test]
    fn lookups_do_not_wait_on_allocation() {
        let store = std::sync::Arc::new(TerrainCellStore::new());
        let k = key(2, 0, 0);
        let i = store.add_cell(k).unwrap();

        let held = store.lock_alloc();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                let found = store.index_of(k);
                let added = store.add_cell(k);
                let claimed = store.schedule_for_generation(i);
                tx.send((found, added, claimed)).unwrap();
            })
        };
        let got = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(held);
        reader.join().unwrap();
        assert_eq!(got, Ok((Some(i), Ok(i), Some(1))));
    }

    #[test]
    fn abandon_returns_to_unloaded_or_ready() {
        let store = TerrainCellStore::new();
        let k = key(0, 0, 0);
        let i = store.add_cell(k).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        assert!(store.abandon_generation(i, v));
        assert_eq!(store.state(i), CellState::Unloaded);

        let v = store.schedule_for_generation(i).unwrap();
        assert!(store.begin_generation(i, v));
        store
            .finish_generation(i, k, v, ShapeHandle::new(4), false)
            .unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        assert!(!store.abandon_generation(i, v - 1));
        assert!(store.abandon_generation(i, v));
        assert_eq!(store.state(i), CellState::Ready);
    }

    #[test]
    fn removal_blocked_by_refs_and_flight() {
        let store = TerrainCellStore::new();
        let i = store.add_cell(key(0, 0, 0)).unwrap();
        store.increment_ref_count(i);
        assert!(!store.try_begin_removal(i));
        store.decrement_ref_count(i);
        let v = store.schedule_for_generation(i).unwrap();
        assert!(!store.try_begin_removal(i));
        store.abandon_generation(i, v);
        assert!(store.try_begin_removal(i));
        assert_eq!(store.state(i), CellState::Removing);
        assert_eq!(store.schedule_for_generation(i), None);
    }

    #[test]
    fn removed_slot_is_reused_with_fresh_state() {
        let store = TerrainCellStore::new();
        let k = key(0, 0, 0);
        let i = store.add_cell(k).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        store.begin_generation(i, v);
        store
            .finish_generation(i, k, v, ShapeHandle::new(77), false)
            .unwrap();
        store.set_active(i, true);

        let removed = store.remove_cell(k).unwrap();
        assert_eq!(removed.index, i);
        assert_eq!(removed.shape, ShapeHandle::new(77));
        assert!(store.is_version_stale(i, v));
        assert_eq!(store.remove_cell(k), None);

        let j = store.add_cell(key(40, 1, -3)).unwrap();
        assert_eq!(j, i);
        let r = store.record(j).unwrap();
        assert_eq!(r.state, CellState::Unloaded);
        assert_eq!(r.shape, None);
        assert!(r.placeholder);
        assert!(!r.active);
        // The old tenant's build can never land on the new tenant.
        assert!(store.check_install(i, k, v).is_err());
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let store = TerrainCellStore::new();
        let i = store.add_cell(key(0, 0, 0)).unwrap();
        assert_eq!(store.decrement_ref_count(i), Some(0));
        assert_eq!(store.increment_ref_count(i), Some(1));
        assert_eq!(store.increment_ref_count(i), Some(2));
        assert_eq!(store.decrement_ref_count(i), Some(1));
        assert_eq!(store.decrement_ref_count(i), Some(0));
        assert_eq!(store.ref_count(i), 0);
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let store = TerrainCellStore::with_limits(PAGE_SIZE, 2 * PAGE_SIZE);
        for n in 0..(2 * PAGE_SIZE) as i32 {
            store.add_cell(key(n, 0, 0)).unwrap();
        }
        assert_eq!(
            store.add_cell(key(-1, 0, 0)),
            Err(StoreError::CapacityExhausted {
                capacity: 2 * PAGE_SIZE
            })
        );
        // Freed slots are still usable after exhaustion.
        store.remove_cell(key(0, 0, 0)).unwrap();
        assert!(store.add_cell(key(-1, 0, 0)).is_ok());
    }

    #[test]
    fn section_ready_needs_final_build() {
        let store = TerrainCellStore::new();
        let k = key(2, 2, 2);
        assert!(!store.is_section_ready(k));
        let i = store.add_cell(k).unwrap();
        let v = store.schedule_for_generation(i).unwrap();
        store.begin_generation(i, v);
        store
            .finish_generation(i, k, v, ShapeHandle::new(3), true)
            .unwrap();
        assert!(!store.is_section_ready(k));
        let v = store.schedule_for_generation(i).unwrap();
        store.begin_generation(i, v);
        store
            .finish_generation(i, k, v, ShapeHandle::new(5), false)
            .unwrap();
        assert!(store.is_section_ready(k));
    }
}
