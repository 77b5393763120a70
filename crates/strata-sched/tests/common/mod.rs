#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::{HashMap, HashSet};
use strata_cell::{CellCoord, CellGrid, CellKey, Voxel, VoxelSnapshot};
use strata_geom::{Aabb, Vec3};
use strata_runtime::{BuildJob, BuildLane, InlineBuilder, JobSink};
use strata_sched::{
    BodyId, BodyProbe, BodySample, PassReport, SchedulerConfig, SchedulerHandle, SnapshotError,
    SnapshotProvider, SnapshotService, SnapshotStats, TerrainContext, TerrainScheduler,
    TrackerConfig,
};
use strata_shape::{BoxMergeBuilder, ShapeBuilder, ShapeDescription};
use strata_sim::{CommandQueue, DrainStats, Simulation};
use strata_store::{CellIndex, ShapeHandle, TerrainCellStore};

pub const CELL: usize = 8;

pub fn key(x: i32, y: i32, z: i32) -> CellKey {
    CellCoord::new(x, y, z).key()
}

/// Solid below `floor`, air above, plus explicit overrides.
pub struct FloorWorld {
    pub grid: CellGrid,
    pub floor: i32,
    pub overrides: HashMap<(i32, i32, i32), Voxel>,
    pub unloaded: HashSet<CellKey>,
    pub snapshots: usize,
}

impl FloorWorld {
    pub fn new(floor: i32) -> Self {
        Self {
            grid: CellGrid::new(CELL),
            floor,
            overrides: HashMap::new(),
            unloaded: HashSet::new(),
            snapshots: 0,
        }
    }

    pub fn set(&mut self, wx: i32, wy: i32, wz: i32, v: Voxel) {
        self.overrides.insert((wx, wy, wz), v);
    }

    fn voxel(&self, wx: i32, wy: i32, wz: i32) -> Voxel {
        match self.overrides.get(&(wx, wy, wz)) {
            Some(&v) => v,
            None if wy < self.floor => Voxel(1),
            None => Voxel::AIR,
        }
    }
}

impl SnapshotProvider for FloorWorld {
    fn snapshot(&mut self, key: CellKey) -> Result<VoxelSnapshot, SnapshotError> {
        if self.unloaded.contains(&key) {
            return Err(SnapshotError::NotLoaded(key));
        }
        self.snapshots += 1;
        let coord = key.coord();
        let (x0, y0, z0) = self.grid.origin(coord);
        let n = self.grid.size() as i32;
        let mut voxels = Vec::with_capacity(CELL * CELL * CELL);
        for y in 0..n {
            for z in 0..n {
                for x in 0..n {
                    voxels.push(self.voxel(x0 + x, y0 + y, z0 + z));
                }
            }
        }
        Ok(VoxelSnapshot::from_voxels(coord, CELL, voxels))
    }
}

#[derive(Default)]
pub struct Probe {
    bodies: Mutex<HashMap<BodyId, BodySample>>,
}

impl Probe {
    pub fn place(&self, body: BodyId, center: Vec3, velocity: Vec3) {
        let sample = BodySample {
            bounds: Aabb::from_center_half_extents(center, Vec3::splat(0.5)),
            velocity,
        };
        self.bodies.lock().unwrap().insert(body, sample);
    }

    pub fn place_box(&self, body: BodyId, bounds: Aabb, velocity: Vec3) {
        self.bodies
            .lock()
            .unwrap()
            .insert(body, BodySample { bounds, velocity });
    }
}

impl BodyProbe for Probe {
    fn sample(&self, body: BodyId) -> Option<BodySample> {
        self.bodies.lock().unwrap().get(&body).copied()
    }
}

#[derive(Default)]
pub struct RecordingSim {
    next: u64,
    pub shapes: HashMap<ShapeHandle, (CellKey, bool, u64)>,
    pub removed: Vec<ShapeHandle>,
}

impl Simulation for RecordingSim {
    fn add_shape(&mut self, key: CellKey, shape: &ShapeDescription, enabled: bool) -> ShapeHandle {
        self.next += 1;
        let h = ShapeHandle::new(self.next).unwrap();
        self.shapes.insert(h, (key, enabled, shape.solid_volume()));
        h
    }

    fn remove_shape(&mut self, handle: ShapeHandle) {
        assert!(self.shapes.remove(&handle).is_some(), "unknown shape {handle}");
        self.removed.push(handle);
    }

    fn set_shape_enabled(&mut self, handle: ShapeHandle, enabled: bool) {
        if let Some(entry) = self.shapes.get_mut(&handle) {
            entry.1 = enabled;
        }
    }
}

/// Forwards to an inline builder, or parks jobs while closed.
pub struct GateSink {
    inner: InlineBuilder,
    closed: AtomicBool,
    parked: Mutex<Vec<(BuildJob, BuildLane)>>,
    pub lanes: Mutex<Vec<(CellKey, BuildLane)>>,
}

impl GateSink {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        let parked = std::mem::take(&mut *self.parked.lock().unwrap());
        for (job, lane) in parked {
            self.inner.submit(job, lane);
        }
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().len()
    }
}

impl JobSink for GateSink {
    fn submit(&self, job: BuildJob, lane: BuildLane) {
        self.lanes.lock().unwrap().push((job.key, lane));
        if self.closed.load(Ordering::SeqCst) {
            self.parked.lock().unwrap().push((job, lane));
        } else {
            self.inner.submit(job, lane);
        }
    }
}

pub fn small_tracker() -> TrackerConfig {
    TrackerConfig {
        load_margin: 1.0,
        activation_margin: 0.5,
        lookahead_secs: 0.0,
        ..TrackerConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<TerrainCellStore>,
    pub sched: TerrainScheduler,
    pub handle: SchedulerHandle,
    pub service: SnapshotService,
    pub gate: Arc<GateSink>,
    pub queue: CommandQueue,
    pub world: FloorWorld,
    pub sim: RecordingSim,
    pub probe: Arc<Probe>,
    pub last_drain: DrainStats,
    pub last_service: SnapshotStats,
}

impl Harness {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self::build(
            Arc::new(TerrainCellStore::new()),
            Arc::new(BoxMergeBuilder::default()),
            cfg,
            small_tracker(),
        )
    }

    pub fn build(
        store: Arc<TerrainCellStore>,
        builder: Arc<dyn ShapeBuilder>,
        cfg: SchedulerConfig,
        tracker: TrackerConfig,
    ) -> Self {
        let queue = CommandQueue::new();
        let (ctx, snapshot_rx) =
            TerrainContext::new(Arc::clone(&store), CellGrid::new(CELL), queue.sender());
        let probe = Arc::new(Probe::default());
        let (sched, handle) = TerrainScheduler::new(ctx, probe.clone(), cfg, tracker);
        let gate = Arc::new(GateSink {
            inner: InlineBuilder::new(Arc::clone(&store), builder, queue.sender()),
            closed: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
            lanes: Mutex::new(Vec::new()),
        });
        let service = SnapshotService::new(
            Arc::clone(&store),
            snapshot_rx,
            gate.clone(),
            handle.clone(),
        );
        Self {
            store,
            sched,
            handle,
            service,
            gate,
            queue,
            world: FloorWorld::new(4),
            sim: RecordingSim::default(),
            probe,
            last_drain: DrainStats::default(),
            last_service: SnapshotStats::default(),
        }
    }

    /// Scheduler pass, then the world thread's snapshot batch, then the
    /// simulation drain.
    pub fn step(&mut self) -> PassReport {
        let report = self.sched.pass().expect("scheduler pass");
        self.last_service = self.service.service(&mut self.world, usize::MAX);
        self.last_drain = self.queue.drain(&mut self.sim, &self.store);
        report
    }

    pub fn steps(&mut self, n: usize) -> PassReport {
        let mut last = PassReport::default();
        for _ in 0..n {
            last = self.step();
        }
        last
    }

    pub fn index(&self, k: CellKey) -> CellIndex {
        self.store.index_of(k).expect("cell is resident")
    }

    pub fn add_body(&mut self, id: u64, center: Vec3) -> BodyId {
        let body = BodyId(id);
        self.probe.place(body, center, Vec3::ZERO);
        self.handle.body_added(body);
        body
    }
}

/// Center of a cell in world units.
pub fn cell_center(x: i32, y: i32, z: i32) -> Vec3 {
    let s = CELL as f32;
    Vec3::new(
        (x as f32 + 0.5) * s,
        (y as f32 + 0.5) * s,
        (z as f32 + 0.5) * s,
    )
}
