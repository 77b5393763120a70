use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use strata_cell::{CellGrid, Voxel};
use strata_geom::Vec3;
use strata_runtime::{JobSink, Runtime, RuntimeStats};
use strata_sched::{
    BodyId, BodyProbe, SchedulerError, SnapshotService, SnapshotStats, TerrainContext,
    TerrainScheduler,
};
use strata_shape::BoxMergeBuilder;
use strata_sim::{CommandQueue, DrainStats};
use strata_store::{StoreStats, TerrainCellStore};

use crate::config::TerrainConfig;
use crate::sim::{DemoSim, PoseBoard, SimStats};
use crate::watch::ConfigWatcher;
use crate::world::{NoiseWorld, STONE};

const WORLD_TICK: Duration = Duration::from_millis(10);
const SIM_DT: f32 = 1.0 / 60.0;
const EDIT_CHANCE: f64 = 0.05;

#[derive(Clone, Debug)]
pub struct DemoOptions {
    pub ticks: u64,
    pub bodies: u32,
    pub seed: u64,
    /// Loaded world half-width, in cells.
    pub extent: i32,
    pub watch: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

#[derive(Clone, Debug, Default)]
pub struct DemoSummary {
    pub passes: u64,
    pub ticks: u64,
    pub edits: u64,
    pub world_snapshots: u64,
    pub snapshots: SnapshotStats,
    pub store: StoreStats,
    pub runtime: RuntimeStats,
    pub drained: DrainStats,
    pub sim: SimStats,
}

impl DemoSummary {
    pub fn log(&self) {
        log::info!(
            "{} world ticks, {} scheduler passes, {} edits",
            self.ticks,
            self.passes,
            self.edits
        );
        log::info!(
            "snapshots: taken={} unavailable={} skipped={} (world served {})",
            self.snapshots.taken,
            self.snapshots.unavailable,
            self.snapshots.skipped,
            self.world_snapshots
        );
        log::info!("store: {:?}", self.store);
        log::info!("runtime: {:?}", self.runtime);
        log::info!("sim commands: {:?}", self.drained);
        log::info!("sim: {:?}", self.sim);
    }
}

fn accumulate(total: &mut SnapshotStats, s: SnapshotStats) {
    total.taken += s.taken;
    total.unavailable += s.unavailable;
    total.skipped += s.skipped;
}

/// Wire a world, scheduler, build lanes and simulation together and run
/// `opts.ticks` world ticks.
pub fn run(cfg: TerrainConfig, opts: &DemoOptions) -> Result<DemoSummary, DemoError> {
    let grid = CellGrid::new(cfg.cell.size);
    let store = Arc::new(TerrainCellStore::new());
    let queue = CommandQueue::new();
    let (ctx, snapshot_rx) = TerrainContext::new(Arc::clone(&store), grid, queue.sender());

    let poses = Arc::new(PoseBoard::default());
    let probe: Arc<dyn BodyProbe> = poses.clone();
    let (scheduler, handle) =
        TerrainScheduler::new(ctx, probe, cfg.scheduler.clone(), cfg.tracker.clone());

    let builder = Arc::new(BoxMergeBuilder::new(cfg.shape.max_boxes));
    let runtime = Arc::new(Runtime::new(
        Arc::clone(&store),
        builder,
        queue.sender(),
        &cfg.runtime,
    ));
    let sink: Arc<dyn JobSink> = runtime.clone();
    let service = SnapshotService::new(Arc::clone(&store), snapshot_rx, sink, handle.clone());

    let mut world = NoiseWorld::new(grid, opts.seed as i32, opts.extent);
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut sim = DemoSim::new(Arc::clone(&poses));
    let size = grid.size() as f32;
    for i in 0..opts.bodies {
        let x = i as f32 * size * 1.5;
        let z = 0.0;
        let ground = world.height_at(x as i32, z as i32) as f32;
        let vel = Vec3::new(rng.random_range(-4.0..4.0), 0.0, rng.random_range(-4.0..4.0));
        let id = BodyId(u64::from(i));
        sim.spawn_body(id, Vec3::new(x, ground + size * 0.5, z), vel);
        handle.body_added(id);
    }

    let watcher = match &opts.watch {
        Some(path) => match ConfigWatcher::new(path) {
            Ok(w) => Some(w),
            Err(e) => {
                log::warn!("config watch disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let scheduler_thread = scheduler.spawn()?;
    let stop = Arc::new(AtomicBool::new(false));
    let sim_thread = {
        let stop = Arc::clone(&stop);
        let store = Arc::clone(&store);
        thread::Builder::new().name("strata-sim".into()).spawn(move || {
            let mut drained = DrainStats::default();
            let tick = Duration::from_secs_f32(SIM_DT);
            while !stop.load(Ordering::Acquire) {
                drained.accumulate(&queue.drain(&mut sim, &store));
                sim.step(SIM_DT);
                thread::sleep(tick);
            }
            drained.accumulate(&queue.drain(&mut sim, &store));
            log::debug!(
                target: "sim",
                "{} shapes at exit, {} enabled",
                sim.shape_count(),
                sim.enabled_cells().len()
            );
            (sim.stats, drained)
        })?
    };

    let mut summary = DemoSummary::default();
    for _ in 0..opts.ticks {
        if scheduler_thread.is_finished() {
            log::warn!("scheduler exited early");
            break;
        }
        if let Some(new) = watcher.as_ref().and_then(ConfigWatcher::poll) {
            if new.cell.size != grid.size() {
                log::warn!("cell size change needs a restart; keeping {}", grid.size());
            }
            handle.reload_config(new.scheduler, new.tracker);
        }
        if rng.random_bool(EDIT_CHANCE) && random_edit(&mut world, &poses, &mut rng, &handle) {
            summary.edits += 1;
        }
        let max = cfg.scheduler.max_snapshots_per_pass;
        accumulate(&mut summary.snapshots, service.service(&mut world, max));
        summary.ticks += 1;
        thread::sleep(WORLD_TICK);
    }

    for id in poses.ids() {
        handle.body_removed(id);
    }
    handle.shutdown();
    let scheduled = scheduler_thread
        .join()
        .map_err(|_| DemoError::Panicked("scheduler"));
    stop.store(true, Ordering::Release);
    let (sim_stats, drained) = sim_thread.join().map_err(|_| DemoError::Panicked("sim"))?;
    summary.passes = scheduled??;

    summary.world_snapshots = world.snapshots;
    summary.store = store.stats();
    summary.runtime = runtime.stats();
    summary.drained = drained;
    summary.sim = sim_stats;
    Ok(summary)
}

/// Flip one voxel just under a random body. Returns false when there is
/// no body to edit around.
fn random_edit(
    world: &mut NoiseWorld,
    poses: &PoseBoard,
    rng: &mut StdRng,
    handle: &strata_sched::SchedulerHandle,
) -> bool {
    let ids = poses.ids();
    let Some(pose) = ids.choose(rng).and_then(|&id| poses.sample(id)) else {
        return false;
    };
    let c = pose.bounds.center();
    let wx = c.x.floor() as i32 + rng.random_range(-3..=3);
    let wy = pose.bounds.min.y.floor() as i32 - 1;
    let wz = c.z.floor() as i32 + rng.random_range(-3..=3);
    let next = if world.voxel(wx, wy, wz).is_solid() {
        Voxel::AIR
    } else {
        STONE
    };
    world.set_voxel(wx, wy, wz, next);
    handle.voxel_edited(wx, wy, wz)
}
