//! Command queue between the terrain pipeline and the simulation thread.
//!
//! Producers (workers, scheduler) only enqueue. The simulation thread drains
//! the queue between steps and is the only place shapes are added to or
//! removed from the simulation, so it never waits on terrain work.
#![forbid(unsafe_code)]

use crossbeam_channel::{Receiver, Sender, unbounded};
use strata_cell::CellKey;
use strata_shape::ShapeDescription;
use strata_store::{CellIndex, InstallRejected, ShapeHandle, TerrainCellStore};

/// Collision world owned by the simulation thread.
pub trait Simulation {
    fn add_shape(&mut self, key: CellKey, shape: &ShapeDescription, enabled: bool) -> ShapeHandle;
    fn remove_shape(&mut self, handle: ShapeHandle);
    fn set_shape_enabled(&mut self, handle: ShapeHandle, enabled: bool);
}

/// A finished build on its way to the simulation.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub key: CellKey,
    pub index: CellIndex,
    pub version: u32,
    pub shape: ShapeDescription,
    pub placeholder: bool,
    /// First build for this cell since it entered the store.
    pub initial: bool,
}

#[derive(Clone, Debug)]
pub enum SimCommand {
    Install(BuildResult),
    Remove { key: CellKey, shape: ShapeHandle },
    Activate { key: CellKey, index: CellIndex },
    Deactivate { key: CellKey, index: CellIndex },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub installed: usize,
    /// Installs that gave a cell its first collision.
    pub first_installs: usize,
    pub placeholders: usize,
    pub replaced: usize,
    pub stale: usize,
    pub removed: usize,
    pub toggled: usize,
}

impl DrainStats {
    pub fn total(&self) -> usize {
        self.installed + self.stale + self.removed + self.toggled
    }

    pub fn accumulate(&mut self, other: &DrainStats) {
        self.installed += other.installed;
        self.first_installs += other.first_installs;
        self.placeholders += other.placeholders;
        self.replaced += other.replaced;
        self.stale += other.stale;
        self.removed += other.removed;
        self.toggled += other.toggled;
    }
}

#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: Sender<SimCommand>,
}

impl CommandSender {
    /// Returns false once the simulation side has gone away.
    pub fn send(&self, cmd: SimCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    pub fn install(&self, result: BuildResult) -> bool {
        self.send(SimCommand::Install(result))
    }

    pub fn remove(&self, key: CellKey, shape: ShapeHandle) -> bool {
        self.send(SimCommand::Remove { key, shape })
    }

    pub fn set_active(&self, key: CellKey, index: CellIndex, active: bool) -> bool {
        if active {
            self.send(SimCommand::Activate { key, index })
        } else {
            self.send(SimCommand::Deactivate { key, index })
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

pub struct CommandQueue {
    tx: Sender<SimCommand>,
    rx: Receiver<SimCommand>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Apply everything queued right now. Call from the simulation thread only.
    pub fn drain<S: Simulation>(&self, sim: &mut S, store: &TerrainCellStore) -> DrainStats {
        self.drain_bounded(sim, store, usize::MAX)
    }

    /// Apply at most `max` commands, in arrival order.
    pub fn drain_bounded<S: Simulation>(
        &self,
        sim: &mut S,
        store: &TerrainCellStore,
        max: usize,
    ) -> DrainStats {
        let mut stats = DrainStats::default();
        for cmd in self.rx.try_iter().take(max) {
            apply(cmd, sim, store, &mut stats);
        }
        if stats.total() > 0 {
            log::trace!(target: "sim", "drained {:?}", stats);
        }
        stats
    }
}

fn apply<S: Simulation>(cmd: SimCommand, sim: &mut S, store: &TerrainCellStore, stats: &mut DrainStats) {
    match cmd {
        SimCommand::Install(result) => install(result, sim, store, stats),
        SimCommand::Remove { key, shape } => {
            log::trace!(target: "sim", "remove {} shape {}", key, shape);
            sim.remove_shape(shape);
            stats.removed += 1;
        }
        SimCommand::Activate { key, index } => toggle(key, index, true, sim, store, stats),
        SimCommand::Deactivate { key, index } => toggle(key, index, false, sim, store, stats),
    }
}

fn install<S: Simulation>(r: BuildResult, sim: &mut S, store: &TerrainCellStore, stats: &mut DrainStats) {
    if let Err(reason) = store.check_install(r.index, r.key, r.version) {
        log_rejection(&r, reason);
        stats.stale += 1;
        return;
    }
    let enabled = store.is_active(r.index);
    let handle = (!r.shape.is_empty()).then(|| sim.add_shape(r.key, &r.shape, enabled));
    match store.finish_generation(r.index, r.key, r.version, handle, r.placeholder) {
        Ok(previous) => {
            if let Some(prev) = previous {
                sim.remove_shape(prev);
                stats.replaced += 1;
            }
            stats.installed += 1;
            if r.initial {
                log::trace!(target: "sim", "first collision for {}", r.key);
                stats.first_installs += 1;
            }
            stats.placeholders += usize::from(r.placeholder);
        }
        Err(reason) => {
            if let Some(h) = handle {
                sim.remove_shape(h);
            }
            log_rejection(&r, reason);
            stats.stale += 1;
        }
    }
}

fn log_rejection(r: &BuildResult, reason: InstallRejected) {
    log::trace!(target: "sim", "dropped build {} v{}: {:?}", r.key, r.version, reason);
}

fn toggle<S: Simulation>(
    key: CellKey,
    index: CellIndex,
    enabled: bool,
    sim: &mut S,
    store: &TerrainCellStore,
    stats: &mut DrainStats,
) {
    if store.key_at(index) != Some(key) {
        return;
    }
    if let Some(h) = store.shape_handle(index) {
        sim.set_shape_enabled(h, enabled);
        stats.toggled += 1;
    }
}
