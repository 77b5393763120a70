//! Shape-building worker lanes (edit and background).
#![forbid(unsafe_code)]

mod arena;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError, select, unbounded};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Deserialize;
use strata_cell::{CellKey, VoxelSnapshot};
use strata_shape::{BuildScratch, ShapeBuilder, placeholder_shape};
use strata_sim::{BuildResult, CommandSender};
use strata_store::{CellIndex, TerrainCellStore};

pub use arena::{MAX_RETAINED_VOXELS, WorkerArena};

/// A snapshot paired with the claim it was taken for.
#[derive(Clone, Debug)]
pub struct BuildJob {
    pub key: CellKey,
    pub index: CellIndex,
    pub version: u32,
    pub initial: bool,
    pub snapshot: VoxelSnapshot,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum BuildLane {
    Edit,
    Background,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum JobOutcome {
    Built,
    Placeholder,
    /// The claim was superseded or the cell went away before the build ran.
    Dropped,
}

/// Anything that accepts build jobs: the threaded [`Runtime`] or the
/// synchronous [`InlineBuilder`].
pub trait JobSink: Send + Sync {
    fn submit(&self, job: BuildJob, lane: BuildLane);
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_edit_workers")]
    pub edit_workers: usize,
    /// 0 derives the count from available parallelism.
    #[serde(default)]
    pub bg_workers: usize,
}

fn default_edit_workers() -> usize {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            edit_workers: default_edit_workers(),
            bg_workers: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    q_edit: AtomicUsize,
    q_bg: AtomicUsize,
    inflight_edit: AtomicUsize,
    inflight_bg: AtomicUsize,
    built: AtomicU64,
    placeholders: AtomicU64,
    dropped: AtomicU64,
    build_us: AtomicU64,
    arenas: Arc<AtomicUsize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub q_edit: usize,
    pub inflight_edit: usize,
    pub q_bg: usize,
    pub inflight_bg: usize,
    pub built: u64,
    pub placeholders: u64,
    pub dropped: u64,
    pub build_us: u64,
}

/// Build one job and hand the result to the simulation queue.
///
/// Moves the cell `Scheduled -> Generating`; a job whose claim is no longer
/// current is dropped without building. Builder failures fall back to the
/// coarse placeholder so the cell keeps some collision.
pub fn process_build_job(
    job: BuildJob,
    store: &TerrainCellStore,
    builder: &dyn ShapeBuilder,
    scratch: &mut BuildScratch,
    commands: &CommandSender,
) -> JobOutcome {
    let BuildJob {
        key,
        index,
        version,
        initial,
        snapshot,
    } = job;

    if store.key_at(index) != Some(key) || !store.begin_generation(index, version) {
        log::trace!(target: "runtime", "skip {} v{}: claim no longer current", key, version);
        return JobOutcome::Dropped;
    }

    let (shape, placeholder) = match builder.build(&snapshot, scratch) {
        Ok(shape) => (shape, false),
        Err(e) => {
            log::warn!(target: "runtime", "shape build failed for {}: {}; using placeholder", key, e);
            (placeholder_shape(&snapshot), true)
        }
    };

    if store.is_version_stale(index, version) {
        return JobOutcome::Dropped;
    }
    commands.install(BuildResult {
        key,
        index,
        version,
        shape,
        placeholder,
        initial,
    });
    if placeholder {
        JobOutcome::Placeholder
    } else {
        JobOutcome::Built
    }
}

struct Worker {
    store: Arc<TerrainCellStore>,
    builder: Arc<dyn ShapeBuilder>,
    commands: CommandSender,
    counters: Arc<Counters>,
}

impl Worker {
    fn arena(&self) -> WorkerArena {
        WorkerArena::new(&self.counters.arenas, MAX_RETAINED_VOXELS)
    }

    fn run(&self, job: BuildJob, lane: BuildLane, arena: &mut WorkerArena) {
        let (queued, inflight) = match lane {
            BuildLane::Edit => (&self.counters.q_edit, &self.counters.inflight_edit),
            BuildLane::Background => (&self.counters.q_bg, &self.counters.inflight_bg),
        };
        queued.fetch_sub(1, Ordering::Relaxed);
        inflight.fetch_add(1, Ordering::Relaxed);
        let t0 = Instant::now();
        let outcome = process_build_job(
            job,
            self.store.as_ref(),
            self.builder.as_ref(),
            arena.scratch(),
            &self.commands,
        );
        arena.end_job();
        let us = t0.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        self.counters.build_us.fetch_add(us, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Built => &self.counters.built,
            JobOutcome::Placeholder => &self.counters.placeholders,
            JobOutcome::Dropped => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Runtime {
    job_tx_edit: Sender<BuildJob>,
    job_tx_bg: Sender<BuildJob>,
    _edit_pool: Arc<ThreadPool>,
    bg_pool: Option<Arc<ThreadPool>>,
    counters: Arc<Counters>,
    pub w_edit: usize,
    pub w_bg: usize,
}

impl Runtime {
    pub fn new(
        store: Arc<TerrainCellStore>,
        builder: Arc<dyn ShapeBuilder>,
        commands: CommandSender,
        cfg: &RuntimeConfig,
    ) -> Self {
        let (job_tx_edit, job_rx_edit) = unbounded::<BuildJob>();
        let (job_tx_bg, job_rx_bg) = unbounded::<BuildJob>();

        let worker_count: usize = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        let w_edit = cfg.edit_workers.max(1);
        let w_bg = if cfg.bg_workers > 0 {
            cfg.bg_workers
        } else {
            worker_count.saturating_sub(w_edit)
        };
        let counters = Arc::new(Counters::default());
        let worker = Arc::new(Worker {
            store,
            builder,
            commands,
            counters: Arc::clone(&counters),
        });

        let edit_pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(w_edit)
                .thread_name(|i| format!("strata-edit-{i}"))
                .build()
                .expect("edit pool"),
        );
        for _ in 0..w_edit {
            let rx = job_rx_edit.clone();
            let worker = Arc::clone(&worker);
            edit_pool.spawn(move || {
                let mut arena = worker.arena();
                while let Ok(job) = rx.recv() {
                    worker.run(job, BuildLane::Edit, &mut arena);
                }
            });
        }

        let bg_pool = if w_bg > 0 {
            let pool = Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(w_bg)
                    .thread_name(|i| format!("strata-bg-{i}"))
                    .build()
                    .expect("bg pool"),
            );
            for _ in 0..w_bg {
                let bg_rx = job_rx_bg.clone();
                let edit_rx = job_rx_edit.clone();
                let worker = Arc::clone(&worker);
                pool.spawn(move || {
                    let mut arena = worker.arena();
                    background_loop(&worker, &mut arena, &bg_rx, &edit_rx);
                });
            }
            Some(pool)
        } else {
            None
        };

        log::info!(target: "runtime", "shape workers: edit={} bg={}", w_edit, w_bg);
        Self {
            job_tx_edit,
            job_tx_bg,
            _edit_pool: edit_pool,
            bg_pool,
            counters,
            w_edit,
            w_bg,
        }
    }

    pub fn submit_build_job_edit(&self, job: BuildJob) {
        self.counters.q_edit.fetch_add(1, Ordering::Relaxed);
        if self.job_tx_edit.send(job).is_err() {
            self.counters.q_edit.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn submit_build_job_bg(&self, job: BuildJob) {
        if self.bg_pool.is_some() {
            self.counters.q_bg.fetch_add(1, Ordering::Relaxed);
            if self.job_tx_bg.send(job).is_err() {
                self.counters.q_bg.fetch_sub(1, Ordering::Relaxed);
            }
        } else {
            self.submit_build_job_edit(job);
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            q_edit: c.q_edit.load(Ordering::Relaxed),
            inflight_edit: c.inflight_edit.load(Ordering::Relaxed),
            q_bg: c.q_bg.load(Ordering::Relaxed),
            inflight_bg: c.inflight_bg.load(Ordering::Relaxed),
            built: c.built.load(Ordering::Relaxed),
            placeholders: c.placeholders.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            build_us: c.build_us.load(Ordering::Relaxed),
        }
    }

    /// True when no job is queued or running.
    pub fn is_idle(&self) -> bool {
        let s = self.stats();
        s.q_edit + s.q_bg + s.inflight_edit + s.inflight_bg == 0
    }

    /// Scratch arenas held by running workers, one per worker thread.
    pub fn scratch_buffers(&self) -> usize {
        self.counters.arenas.load(Ordering::Relaxed)
    }
}

impl JobSink for Runtime {
    fn submit(&self, job: BuildJob, lane: BuildLane) {
        match lane {
            BuildLane::Edit => self.submit_build_job_edit(job),
            BuildLane::Background => self.submit_build_job_bg(job),
        }
    }
}

/// Background workers prefer edit jobs whenever both lanes have work.
fn background_loop(
    worker: &Worker,
    arena: &mut WorkerArena,
    bg_rx: &Receiver<BuildJob>,
    edit_rx: &Receiver<BuildJob>,
) {
    loop {
        match edit_rx.try_recv() {
            Ok(job) => {
                worker.run(job, BuildLane::Edit, arena);
                continue;
            }
            Err(TryRecvError::Disconnected) => {
                while let Ok(job) = bg_rx.recv() {
                    worker.run(job, BuildLane::Background, arena);
                }
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        match bg_rx.try_recv() {
            Ok(job) => {
                worker.run(job, BuildLane::Background, arena);
                continue;
            }
            Err(TryRecvError::Disconnected) => {
                while let Ok(job) = edit_rx.recv() {
                    worker.run(job, BuildLane::Edit, arena);
                }
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        select! {
            recv(edit_rx) -> res => match res {
                Ok(job) => worker.run(job, BuildLane::Edit, arena),
                Err(_) => {
                    while let Ok(job) = bg_rx.recv() {
                        worker.run(job, BuildLane::Background, arena);
                    }
                    break;
                }
            },
            recv(bg_rx) -> res => match res {
                Ok(job) => worker.run(job, BuildLane::Background, arena),
                Err(_) => {
                    while let Ok(job) = edit_rx.recv() {
                        worker.run(job, BuildLane::Edit, arena);
                    }
                    break;
                }
            },
        }
    }
}

/// Builds on the submitting thread. Deterministic; used by tests and the
/// single-threaded demo mode.
pub struct InlineBuilder {
    store: Arc<TerrainCellStore>,
    builder: Arc<dyn ShapeBuilder>,
    commands: CommandSender,
    scratch: Mutex<BuildScratch>,
    outcomes: Mutex<Vec<(CellKey, JobOutcome)>>,
}

impl InlineBuilder {
    pub fn new(
        store: Arc<TerrainCellStore>,
        builder: Arc<dyn ShapeBuilder>,
        commands: CommandSender,
    ) -> Self {
        Self {
            store,
            builder,
            commands,
            scratch: Mutex::new(BuildScratch::new()),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes recorded since the last call.
    pub fn take_outcomes(&self) -> Vec<(CellKey, JobOutcome)> {
        std::mem::take(&mut *self.outcomes.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl JobSink for InlineBuilder {
    fn submit(&self, job: BuildJob, _lane: BuildLane) {
        let key = job.key;
        let outcome = {
            let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
            process_build_job(
                job,
                self.store.as_ref(),
                self.builder.as_ref(),
                &mut scratch,
                &self.commands,
            )
        };
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, outcome));
    }
}
