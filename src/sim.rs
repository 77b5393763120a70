//! Demo collision world: axis-aligned bodies falling onto terrain boxes.

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use strata_cell::CellKey;
use strata_geom::{Aabb, Vec3};
use strata_sched::{BodyId, BodyProbe, BodySample};
use strata_shape::ShapeDescription;
use strata_sim::Simulation;
use strata_store::ShapeHandle;

const GRAVITY: f32 = -20.0;
/// Bodies below this height fell through unloaded terrain and respawn.
const KILL_PLANE: f32 = -64.0;
const HOP_EVERY: u64 = 240;
const HOP_SPEED: f32 = 8.0;

/// Latest pose of every body, shared with the scheduler's trackers.
#[derive(Default)]
pub struct PoseBoard {
    poses: Mutex<HashMap<BodyId, BodySample>>,
}

impl PoseBoard {
    pub fn publish(&self, id: BodyId, sample: BodySample) {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sample);
    }

    pub fn ids(&self) -> Vec<BodyId> {
        let poses = self.poses.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<BodyId> = poses.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl BodyProbe for PoseBoard {
    fn sample(&self, body: BodyId) -> Option<BodySample> {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&body)
            .copied()
    }
}

struct Installed {
    key: CellKey,
    boxes: Vec<Aabb>,
    enabled: bool,
}

struct Body {
    id: BodyId,
    spawn: Vec3,
    pos: Vec3,
    vel: Vec3,
    half: Vec3,
    grounded: bool,
}

impl Body {
    fn bounds_at(&self, pos: Vec3) -> Aabb {
        Aabb::from_center_half_extents(pos, self.half)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub steps: u64,
    pub contacts: u64,
    pub respawns: u64,
    pub shapes_added: u64,
    pub shapes_removed: u64,
}

pub struct DemoSim {
    shapes: HashMap<ShapeHandle, Installed>,
    next_handle: u64,
    bodies: Vec<Body>,
    poses: Arc<PoseBoard>,
    pub stats: SimStats,
}

impl DemoSim {
    pub fn new(poses: Arc<PoseBoard>) -> Self {
        Self {
            shapes: HashMap::new(),
            next_handle: 1,
            bodies: Vec::new(),
            poses,
            stats: SimStats::default(),
        }
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    /// Cells that currently hold a shape with collision enabled.
    pub fn enabled_cells(&self) -> Vec<CellKey> {
        let mut keys: Vec<CellKey> = self
            .shapes
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.key)
            .collect();
        keys.sort();
        keys
    }

    pub fn spawn_body(&mut self, id: BodyId, pos: Vec3, vel: Vec3) {
        let body = Body {
            id,
            spawn: pos,
            pos,
            vel,
            half: Vec3::new(0.4, 0.9, 0.4),
            grounded: false,
        };
        self.publish(&body);
        self.bodies.push(body);
    }

    pub fn step(&mut self, dt: f32) {
        let mut bodies = std::mem::take(&mut self.bodies);
        for body in &mut bodies {
            self.integrate(body, dt);
            self.publish(body);
        }
        self.bodies = bodies;
        self.stats.steps += 1;
    }

    fn integrate(&mut self, body: &mut Body, dt: f32) {
        if body.grounded && self.stats.steps % HOP_EVERY == HOP_EVERY - 1 {
            body.vel.y = HOP_SPEED;
        }
        body.vel.y += GRAVITY * dt;

        // Axis-separated moves; a blocked axis is reverted.
        let dy = Vec3::new(0.0, body.vel.y * dt, 0.0);
        body.grounded = false;
        if self.blocked(body.bounds_at(body.pos + dy)) {
            if body.vel.y < 0.0 {
                body.grounded = true;
            }
            body.vel.y = 0.0;
            self.stats.contacts += 1;
        } else {
            body.pos = body.pos + dy;
        }

        let dx = Vec3::new(body.vel.x * dt, 0.0, 0.0);
        if self.blocked(body.bounds_at(body.pos + dx)) {
            body.vel.x = -body.vel.x;
            self.stats.contacts += 1;
        } else {
            body.pos = body.pos + dx;
        }

        let dz = Vec3::new(0.0, 0.0, body.vel.z * dt);
        if self.blocked(body.bounds_at(body.pos + dz)) {
            body.vel.z = -body.vel.z;
            self.stats.contacts += 1;
        } else {
            body.pos = body.pos + dz;
        }

        if body.pos.y < KILL_PLANE {
            log::debug!(target: "sim", "body {:?} fell through at {:?}", body.id, body.pos);
            body.pos = body.spawn;
            body.vel.y = 0.0;
            self.stats.respawns += 1;
        }
    }

    fn blocked(&self, bb: Aabb) -> bool {
        self.shapes
            .values()
            .filter(|s| s.enabled)
            .any(|s| s.boxes.iter().any(|b| b.intersects(&bb)))
    }

    fn publish(&self, body: &Body) {
        self.poses.publish(
            body.id,
            BodySample {
                bounds: body.bounds_at(body.pos),
                velocity: body.vel,
            },
        );
    }
}

impl Simulation for DemoSim {
    fn add_shape(&mut self, key: CellKey, shape: &ShapeDescription, enabled: bool) -> ShapeHandle {
        let raw = self.next_handle;
        self.next_handle += 1;
        // Handles start at 1 and only grow, so this never hits the reserved 0.
        let Some(handle) = ShapeHandle::new(raw) else {
            unreachable!("shape handle counter wrapped");
        };
        self.shapes.insert(
            handle,
            Installed {
                key,
                boxes: shape.world_boxes().collect(),
                enabled,
            },
        );
        self.stats.shapes_added += 1;
        handle
    }

    fn remove_shape(&mut self, handle: ShapeHandle) {
        if self.shapes.remove(&handle).is_some() {
            self.stats.shapes_removed += 1;
        } else {
            log::warn!(target: "sim", "remove of unknown shape {}", handle);
        }
    }

    fn set_shape_enabled(&mut self, handle: ShapeHandle, enabled: bool) {
        if let Some(s) = self.shapes.get_mut(&handle) {
            s.enabled = enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cell::{CellCoord, VoxelSnapshot, Voxel};
    use strata_shape::{BoxMergeBuilder, BuildScratch, ShapeBuilder};

    fn floor_shape(coord: CellCoord) -> ShapeDescription {
        let mut snap = VoxelSnapshot::filled(coord, 8, Voxel::AIR);
        for z in 0..8 {
            for x in 0..8 {
                snap.set_local(x, 0, z, Voxel(1));
            }
        }
        BoxMergeBuilder::default()
            .build(&snap, &mut BuildScratch::new())
            .unwrap()
    }

    #[test]
    fn body_lands_on_enabled_floor() {
        let poses = Arc::new(PoseBoard::default());
        let mut sim = DemoSim::new(Arc::clone(&poses));
        let coord = CellCoord::new(0, 0, 0);
        sim.add_shape(coord.key(), &floor_shape(coord), true);
        sim.spawn_body(BodyId(1), Vec3::new(4.0, 4.0, 4.0), Vec3::ZERO);

        for _ in 0..120 {
            sim.step(1.0 / 60.0);
        }
        let pose = poses.sample(BodyId(1)).unwrap();
        assert!(pose.bounds.min.y >= 1.0 - 1e-3, "sank to {:?}", pose.bounds);
        assert!(pose.bounds.min.y < 1.5);
        assert!(sim.stats.contacts > 0);
    }

    #[test]
    fn disabled_shape_lets_bodies_through() {
        let poses = Arc::new(PoseBoard::default());
        let mut sim = DemoSim::new(Arc::clone(&poses));
        let coord = CellCoord::new(0, 0, 0);
        let h = sim.add_shape(coord.key(), &floor_shape(coord), true);
        sim.set_shape_enabled(h, false);
        assert!(sim.enabled_cells().is_empty());
        sim.spawn_body(BodyId(1), Vec3::new(4.0, 4.0, 4.0), Vec3::ZERO);

        for _ in 0..60 {
            sim.step(1.0 / 60.0);
        }
        let pose = poses.sample(BodyId(1)).unwrap();
        assert!(pose.bounds.min.y < 0.0);
        assert_eq!(sim.stats.contacts, 0);
    }

    #[test]
    fn probe_lists_spawned_bodies_in_order() {
        let poses = Arc::new(PoseBoard::default());
        let mut sim = DemoSim::new(Arc::clone(&poses));
        sim.spawn_body(BodyId(7), Vec3::ZERO, Vec3::ZERO);
        sim.spawn_body(BodyId(2), Vec3::splat(3.0), Vec3::ZERO);
        assert_eq!(poses.ids(), vec![BodyId(2), BodyId(7)]);
        let s = poses.sample(BodyId(2)).unwrap();
        assert!((s.bounds.center() - Vec3::splat(3.0)).length_sq() < 1e-6);
        assert!(poses.sample(BodyId(9)).is_none());
    }

    #[test]
    fn shape_bookkeeping_tracks_adds_and_removes() {
        let mut sim = DemoSim::new(Arc::new(PoseBoard::default()));
        let coord = CellCoord::new(1, 0, 0);
        let h = sim.add_shape(coord.key(), &floor_shape(coord), false);
        assert_eq!(sim.shape_count(), 1);
        sim.remove_shape(h);
        assert_eq!(sim.shape_count(), 0);
        assert_eq!(sim.stats.shapes_added, 1);
        assert_eq!(sim.stats.shapes_removed, 1);
    }
}
