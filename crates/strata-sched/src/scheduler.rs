use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use hashbrown::{HashMap, HashSet};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use strata_cell::CellKey;
use strata_store::{CellIndex, CellState, StoreError};

use crate::{
    BodyId, BodyProbe, IntentSet, ObjectTracker, PendingRequest, Priority, SchedulerConfig,
    SchedulerError, SchedulerEvent, SchedulerHandle, TerrainContext, TrackedCells, TrackerConfig,
};

/// What one pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pass: u64,
    pub events: usize,
    pub trackers: usize,
    pub acquired: usize,
    pub released: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub invalidated: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub removed: usize,
    pub admitted: usize,
    /// Claimed requests still waiting for admission after this pass.
    pub pending: usize,
    /// Edits waiting for an in-flight build to finish.
    pub deferred: usize,
}

impl PassReport {
    /// True if the pass changed nothing.
    pub fn is_idle(&self) -> bool {
        self.acquired
            + self.released
            + self.activated
            + self.deactivated
            + self.invalidated
            + self.retried
            + self.abandoned
            + self.removed
            + self.admitted
            == 0
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass {}: ev={} trk={} ref+{} ref-{} act+{} act-{} inval={} retry={} abandon={} rm={} admit={} pending={} deferred={}",
            self.pass,
            self.events,
            self.trackers,
            self.acquired,
            self.released,
            self.activated,
            self.deactivated,
            self.invalidated,
            self.retried,
            self.abandoned,
            self.removed,
            self.admitted,
            self.pending,
            self.deferred,
        )
    }
}

pub struct TerrainScheduler {
    ctx: TerrainContext,
    probe: Arc<dyn BodyProbe>,
    cfg: SchedulerConfig,
    tracker_cfg: TrackerConfig,
    events: Receiver<SchedulerEvent>,
    inbox: Vec<SchedulerEvent>,
    pool: Option<ThreadPool>,
    trackers: HashMap<BodyId, ObjectTracker>,
    /// Keys held through `request_chunk`, one reference each.
    holds: HashSet<CellKey>,
    /// Cells currently enabled in the simulation.
    active: HashSet<CellKey>,
    pending: IntentSet,
    /// Edits that landed while the cell's snapshot was already taken.
    deferred: HashMap<CellKey, Priority>,
    /// Cells to re-claim, keyed to the pass they become due.
    retry: HashMap<CellKey, u64>,
    /// Unreferenced cells, keyed to the first pass they may be removed in.
    released: HashMap<CellKey, u64>,
    pass_no: u64,
    running: bool,
}

impl TerrainScheduler {
    pub fn new(
        ctx: TerrainContext,
        probe: Arc<dyn BodyProbe>,
        cfg: SchedulerConfig,
        tracker_cfg: TrackerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = unbounded();
        let handle = SchedulerHandle::new(tx, Arc::clone(&ctx.store));
        let pool = build_tracker_pool(cfg.tracker_threads);
        let sched = Self {
            ctx,
            probe,
            cfg,
            tracker_cfg,
            events: rx,
            inbox: Vec::new(),
            pool,
            trackers: HashMap::new(),
            holds: HashSet::new(),
            active: HashSet::new(),
            pending: IntentSet::new(),
            deferred: HashMap::new(),
            retry: HashMap::new(),
            released: HashMap::new(),
            pass_no: 0,
            running: true,
        };
        (sched, handle)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn tracker_config(&self) -> &TrackerConfig {
        &self.tracker_cfg
    }

    pub fn passes(&self) -> u64 {
        self.pass_no
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn active_cells(&self) -> &HashSet<CellKey> {
        &self.active
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// One scheduling pass. Only store exhaustion is an error.
    pub fn pass(&mut self) -> Result<PassReport, SchedulerError> {
        self.pass_no += 1;
        let mut report = PassReport {
            pass: self.pass_no,
            ..PassReport::default()
        };
        self.drain_events(&mut report)?;
        self.update_trackers(&mut report)?;
        self.sync_activation(&mut report);
        self.sweep_removals(&mut report);
        self.retry_due(&mut report);
        self.drop_unreferenced(&mut report);
        self.admit(&mut report);
        report.trackers = self.trackers.len();
        report.pending = self.pending.len();
        report.deferred = self.deferred.len();
        Ok(report)
    }

    /// Run passes every `pass_interval` until shutdown or until every handle
    /// is dropped. Events arriving between passes are buffered for the next.
    pub fn run(mut self) -> Result<u64, SchedulerError> {
        log::info!(target: "sched", "scheduler running, pass every {:?}", self.cfg.pass_interval());
        while self.running {
            let started = Instant::now();
            let report = self.pass().inspect_err(|e| {
                log::error!(target: "sched", "scheduler stopping: {}", e);
            })?;
            if !report.is_idle() {
                log::debug!(target: "sched", "{}", report);
            }
            let deadline = started + self.cfg.pass_interval();
            while self.running {
                match self.events.recv_deadline(deadline) {
                    // One more pass applies whatever arrived before it.
                    Ok(SchedulerEvent::Shutdown) => {
                        self.inbox.push(SchedulerEvent::Shutdown);
                        break;
                    }
                    Ok(ev) => self.inbox.push(ev),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => self.running = false,
                }
            }
        }
        log::info!(target: "sched", "scheduler stopped after {} passes", self.pass_no);
        Ok(self.pass_no)
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<u64, SchedulerError>>> {
        thread::Builder::new()
            .name("strata-sched".into())
            .spawn(move || self.run())
    }

    fn drain_events(&mut self, report: &mut PassReport) -> Result<(), StoreError> {
        let mut batch = std::mem::take(&mut self.inbox);
        batch.extend(self.events.try_iter());
        report.events = batch.len();
        for ev in batch {
            self.apply_event(ev, report)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, ev: SchedulerEvent, report: &mut PassReport) -> Result<(), StoreError> {
        match ev {
            SchedulerEvent::BodyAdded(body) => {
                self.trackers
                    .entry(body)
                    .or_insert_with(|| ObjectTracker::new(body));
            }
            SchedulerEvent::BodyRemoved(body) => {
                if let Some(tracker) = self.trackers.remove(&body) {
                    for key in tracker.release_all() {
                        self.release(key, report);
                    }
                }
            }
            SchedulerEvent::VoxelEdited { wx, wy, wz } => {
                for c in self.ctx.grid.affected_cells(wx, wy, wz) {
                    self.invalidate(c.key(), Priority::EDIT, report);
                }
            }
            SchedulerEvent::CellUnloaded(key) => self.on_cell_unloaded(key),
            SchedulerEvent::RequestChunk(key) => {
                if self.holds.insert(key) {
                    self.acquire(key, report)?;
                }
            }
            SchedulerEvent::ReleaseChunk(key) => {
                if self.holds.remove(&key) {
                    self.release(key, report);
                }
            }
            SchedulerEvent::Prioritize(key, priority) => self.prioritize(key, priority, report),
            SchedulerEvent::SnapshotUnavailable(key) => {
                let due = self.pass_no + self.cfg.retry_after_passes;
                self.retry.insert(key, due);
            }
            SchedulerEvent::ClaimAbandoned(key) => {
                self.retry.entry(key).or_insert(self.pass_no);
            }
            SchedulerEvent::ConfigChanged(cfg, tracker_cfg) => {
                if cfg.tracker_threads != self.cfg.tracker_threads {
                    self.pool = build_tracker_pool(cfg.tracker_threads);
                }
                log::info!(target: "sched", "config reloaded: {:?} {:?}", cfg, tracker_cfg);
                self.cfg = cfg;
                self.tracker_cfg = tracker_cfg;
            }
            SchedulerEvent::Shutdown => self.running = false,
        }
        Ok(())
    }

    /// Take one reference; the 0 -> 1 edge loads the cell.
    fn acquire(&mut self, key: CellKey, report: &mut PassReport) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        let index = store.add_cell(key)?;
        report.acquired += 1;
        if store.increment_ref_count(index) == Some(1) {
            self.released.remove(&key);
            if store.state(index) == CellState::Unloaded {
                self.claim(key, index, Priority::LOAD);
            }
        }
        Ok(())
    }

    /// Drop one reference; the 1 -> 0 edge starts the removal grace period.
    fn release(&mut self, key: CellKey, report: &mut PassReport) {
        let Some(index) = self.ctx.store.index_of(key) else {
            return;
        };
        report.released += 1;
        if self.ctx.store.decrement_ref_count(index) == Some(0) {
            let due = self.pass_no + self.cfg.removal_grace_passes;
            self.released.entry(key).or_insert(due);
        }
    }

    fn claim(&mut self, key: CellKey, index: CellIndex, priority: Priority) -> bool {
        let store = &self.ctx.store;
        let Some(version) = store.schedule_for_generation(index) else {
            return false;
        };
        let initial = store.is_placeholder(index) && store.shape_handle(index).is_none();
        self.pending.record(PendingRequest {
            key,
            index,
            version,
            initial,
            priority,
        });
        true
    }

    /// Rebuild `key` because its voxels changed.
    fn invalidate(&mut self, key: CellKey, priority: Priority, report: &mut PassReport) {
        let Some(index) = self.ctx.store.index_of(key) else {
            return;
        };
        // Not yet snapshotted: the queued request will see the edit.
        if self.pending.raise(key, priority) {
            return;
        }
        if self.ctx.store.ref_count(index) > 0 && self.claim(key, index, priority) {
            report.invalidated += 1;
            return;
        }
        if self.ctx.store.state(index) != CellState::Removing {
            let e = self.deferred.entry(key).or_insert(priority);
            *e = (*e).max(priority);
        }
    }

    fn prioritize(&mut self, key: CellKey, priority: Priority, report: &mut PassReport) {
        if self.pending.raise(key, priority) {
            return;
        }
        let store = &self.ctx.store;
        let Some(index) = store.index_of(key) else {
            return;
        };
        if store.ref_count(index) == 0 {
            return;
        }
        let stale = match store.state(index) {
            CellState::Unloaded => true,
            CellState::Ready => store.is_placeholder(index),
            _ => false,
        };
        if stale && self.claim(key, index, priority) {
            report.invalidated += 1;
        }
    }

    fn on_cell_unloaded(&mut self, key: CellKey) {
        let store = &self.ctx.store;
        if let Some(req) = self.pending.remove(key) {
            store.abandon_generation(req.index, req.version);
        }
        self.deferred.remove(&key);
        let Some(index) = store.index_of(key) else {
            return;
        };
        if store.ref_count(index) == 0 {
            self.released.insert(key, self.pass_no);
        } else {
            self.retry.insert(key, self.pass_no + self.cfg.retry_after_passes);
        }
    }

    fn update_trackers(&mut self, report: &mut PassReport) -> Result<(), StoreError> {
        if self.trackers.is_empty() {
            return Ok(());
        }
        let mut updates: Vec<(BodyId, Option<TrackedCells>)> = {
            let probe = self.probe.as_ref();
            let grid = &self.ctx.grid;
            let cfg = &self.tracker_cfg;
            let trackers: Vec<&ObjectTracker> = self.trackers.values().collect();
            let compute = || {
                trackers
                    .par_iter()
                    .map(|t| (t.body(), t.update(probe, grid, cfg)))
                    .collect::<Vec<_>>()
            };
            match &self.pool {
                Some(pool) => pool.install(compute),
                None => compute(),
            }
        };
        updates.sort_unstable_by_key(|(body, _)| *body);

        for (body, cells) in updates {
            let Some(cells) = cells else {
                continue;
            };
            let Some(tracker) = self.trackers.get_mut(&body) else {
                continue;
            };
            let diff = tracker.apply(cells);
            for key in diff.acquired {
                self.acquire(key, report)?;
            }
            for key in diff.released {
                self.release(key, report);
            }
        }
        Ok(())
    }

    /// Diff the union of tracker activation sets against the current one.
    fn sync_activation(&mut self, report: &mut PassReport) {
        let required: HashSet<CellKey> = self
            .trackers
            .values()
            .flat_map(|t| t.active().iter().copied())
            .collect();
        let store = &self.ctx.store;
        let commands = &self.ctx.commands;
        for &key in required.difference(&self.active) {
            if let Some(index) = store.index_of(key) {
                store.set_active(index, true);
                commands.set_active(key, index, true);
                report.activated += 1;
            }
        }
        for &key in self.active.difference(&required) {
            if let Some(index) = store.index_of(key) {
                store.set_active(index, false);
                commands.set_active(key, index, false);
                report.deactivated += 1;
            }
        }
        self.active = required;
    }

    fn sweep_removals(&mut self, report: &mut PassReport) {
        let now = self.pass_no;
        let due: Vec<CellKey> = self
            .released
            .iter()
            .filter(|&(_, &at)| at <= now)
            .map(|(&k, _)| k)
            .collect();
        let store = &self.ctx.store;
        for key in due {
            let Some(index) = store.index_of(key) else {
                self.released.remove(&key);
                continue;
            };
            if store.ref_count(index) != 0 {
                self.released.remove(&key);
                continue;
            }
            // In flight: try again next pass.
            if !store.try_begin_removal(index) {
                continue;
            }
            self.released.remove(&key);
            self.deferred.remove(&key);
            self.retry.remove(&key);
            self.active.remove(&key);
            if let Some(removed) = store.remove_cell(key) {
                if let Some(shape) = removed.shape {
                    self.ctx.commands.remove(key, shape);
                }
                report.removed += 1;
                log::trace!(target: "sched", "removed {} from slot {}", key, removed.index);
            }
        }
    }

    /// Re-issue deferred edits and due retries for cells still referenced.
    fn retry_due(&mut self, report: &mut PassReport) {
        let deferred = std::mem::take(&mut self.deferred);
        for (key, priority) in deferred {
            let Some(index) = self.ctx.store.index_of(key) else {
                continue;
            };
            if self.pending.raise(key, priority) {
                continue;
            }
            if self.ctx.store.ref_count(index) > 0 && self.claim(key, index, priority) {
                report.retried += 1;
            } else {
                self.deferred.insert(key, priority);
            }
        }

        let now = self.pass_no;
        let due: Vec<CellKey> = self
            .retry
            .iter()
            .filter(|&(_, &at)| at <= now)
            .map(|(&k, _)| k)
            .collect();
        for key in due {
            self.retry.remove(&key);
            if self.pending.contains(key) {
                continue;
            }
            let store = &self.ctx.store;
            let Some(index) = store.index_of(key) else {
                continue;
            };
            if store.ref_count(index) == 0 {
                continue;
            }
            let needs_build = match store.state(index) {
                CellState::Unloaded => true,
                CellState::Ready => store.is_placeholder(index),
                _ => false,
            };
            if needs_build && self.claim(key, index, Priority::LOAD) {
                report.retried += 1;
            }
        }
    }

    /// Release claims on cells nobody references any more.
    fn drop_unreferenced(&mut self, report: &mut PassReport) {
        let store = &self.ctx.store;
        let dropped = self
            .pending
            .extract_if(|r| store.key_at(r.index) != Some(r.key) || store.ref_count(r.index) == 0);
        for r in dropped {
            store.abandon_generation(r.index, r.version);
            report.abandoned += 1;
        }
    }

    /// Hand the best-ranked requests to the world thread. Requests it has not
    /// taken yet count against this pass's budget.
    fn admit(&mut self, report: &mut PassReport) {
        let budget = self
            .cfg
            .max_snapshots_per_pass
            .saturating_sub(self.ctx.queued_snapshots());
        for req in self.pending.take_ranked(budget) {
            if self.ctx.snapshot_tx.send(req).is_ok() {
                report.admitted += 1;
            } else {
                self.ctx.store.abandon_generation(req.index, req.version);
            }
        }
    }
}

fn build_tracker_pool(threads: usize) -> Option<ThreadPool> {
    if threads == 0 {
        return None;
    }
    match ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("strata-track-{i}"))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            log::warn!(target: "sched", "tracker pool unavailable ({}); using the global pool", e);
            None
        }
    }
}
