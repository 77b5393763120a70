use hashbrown::HashSet;
use strata_cell::{CellGrid, CellKey};
use strata_geom::{Aabb, Vec3};

use crate::TrackerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub u64);

/// Current pose of a tracked body, read off the simulation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodySample {
    pub bounds: Aabb,
    pub velocity: Vec3,
}

/// Read-only access to tracked bodies, callable from any thread.
pub trait BodyProbe: Send + Sync {
    fn sample(&self, body: BodyId) -> Option<BodySample>;
}

/// Cells one body needs this pass. `active` is a subset of `resident`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackedCells {
    pub resident: HashSet<CellKey>,
    pub active: HashSet<CellKey>,
}

/// Reference changes produced by applying a fresh [`TrackedCells`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackerDiff {
    pub acquired: Vec<CellKey>,
    pub released: Vec<CellKey>,
}

/// Holds one reference on every cell resident around its body.
#[derive(Debug)]
pub struct ObjectTracker {
    body: BodyId,
    cells: TrackedCells,
}

/// Offset the resident region reaches ahead of the body.
fn lookahead(velocity: Vec3, cfg: &TrackerConfig) -> Vec3 {
    let ahead = velocity * cfg.lookahead_secs.max(0.0);
    let len = ahead.length_sq().sqrt();
    let max = cfg.max_lookahead.max(0.0);
    if len > max { ahead * (max / len) } else { ahead }
}

impl ObjectTracker {
    pub fn new(body: BodyId) -> Self {
        Self {
            body,
            cells: TrackedCells::default(),
        }
    }

    pub fn body(&self) -> BodyId {
        self.body
    }

    pub fn resident(&self) -> &HashSet<CellKey> {
        &self.cells.resident
    }

    pub fn active(&self) -> &HashSet<CellKey> {
        &self.cells.active
    }

    /// Compute the cells the body needs now. Pure; safe on any worker.
    ///
    /// The resident region is the body's box swept along its velocity for
    /// `lookahead_secs`, at most `max_lookahead` voxels, then inflated by
    /// `load_margin`. The active region is the unswept box inflated by
    /// `activation_margin`. Returns `None` when the body is gone, its pose is
    /// not finite, or its region exceeds `max_cells_per_body`; the previous
    /// cells are kept in each case.
    pub fn update(&self, probe: &dyn BodyProbe, grid: &CellGrid, cfg: &TrackerConfig) -> Option<TrackedCells> {
        let s = probe.sample(self.body)?;
        if !s.bounds.is_finite() || !s.velocity.is_finite() {
            log::warn!(target: "sched", "body {:?} has a non-finite pose; keeping its cells", self.body);
            return None;
        }
        let reach = s.bounds.swept(lookahead(s.velocity, cfg));
        let limit = cfg.max_cells_per_body;
        let Some(resident) = grid.cells_overlapping(&reach.inflate(cfg.load_margin.max(0.0)), limit)
        else {
            log::warn!(
                target: "sched",
                "body {:?} spans more than {} cells; keeping its cells",
                self.body,
                limit
            );
            return None;
        };
        let resident: HashSet<CellKey> = resident.into_iter().map(|c| c.key()).collect();
        let active = grid
            .cells_overlapping(&s.bounds.inflate(cfg.activation_margin.max(0.0)), limit)
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.key())
            .filter(|k| resident.contains(k))
            .collect();
        Some(TrackedCells { resident, active })
    }

    /// Adopt `next` and report which references to take and drop.
    pub fn apply(&mut self, next: TrackedCells) -> TrackerDiff {
        let acquired = next
            .resident
            .difference(&self.cells.resident)
            .copied()
            .collect();
        let released = self
            .cells
            .resident
            .difference(&next.resident)
            .copied()
            .collect();
        self.cells = next;
        TrackerDiff { acquired, released }
    }

    /// Consume the tracker, returning every reference it held.
    pub fn release_all(self) -> Vec<CellKey> {
        self.cells.resident.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cell::CellCoord;

    struct Fixed(Option<BodySample>);

    impl BodyProbe for Fixed {
        fn sample(&self, _body: BodyId) -> Option<BodySample> {
            self.0
        }
    }

    fn at(center: Vec3, velocity: Vec3) -> Fixed {
        Fixed(Some(BodySample {
            bounds: Aabb::from_center_half_extents(center, Vec3::splat(0.5)),
            velocity,
        }))
    }

    #[test]
    fn resting_body_in_cell_center() {
        let grid = CellGrid::new(16);
        let cfg = TrackerConfig {
            load_margin: 1.0,
            activation_margin: 1.0,
            lookahead_secs: 0.5,
            ..TrackerConfig::default()
        };
        let t = ObjectTracker::new(BodyId(1));
        let cells = t.update(&at(Vec3::splat(8.0), Vec3::ZERO), &grid, &cfg).unwrap();
        assert_eq!(cells.resident.len(), 1);
        assert!(cells.resident.contains(&CellCoord::new(0, 0, 0).key()));
        assert_eq!(cells.active, cells.resident);
    }

    #[test]
    fn velocity_extends_resident_region_forward_only() {
        let grid = CellGrid::new(16);
        let cfg = TrackerConfig {
            load_margin: 1.0,
            activation_margin: 0.0,
            lookahead_secs: 1.0,
            ..TrackerConfig::default()
        };
        let t = ObjectTracker::new(BodyId(1));
        let cells = t
            .update(&at(Vec3::splat(8.0), Vec3::new(20.0, 0.0, 0.0)), &grid, &cfg)
            .unwrap();
        assert!(cells.resident.contains(&CellCoord::new(1, 0, 0).key()));
        assert!(!cells.resident.contains(&CellCoord::new(-1, 0, 0).key()));
        assert_eq!(cells.active.len(), 1);
    }

    #[test]
    fn apply_reports_edges() {
        let mut t = ObjectTracker::new(BodyId(7));
        let a = CellCoord::new(0, 0, 0).key();
        let b = CellCoord::new(1, 0, 0).key();
        let c = CellCoord::new(2, 0, 0).key();

        let first = t.apply(TrackedCells {
            resident: [a, b].into_iter().collect(),
            active: HashSet::new(),
        });
        assert_eq!(first.acquired.len(), 2);
        assert!(first.released.is_empty());

        let second = t.apply(TrackedCells {
            resident: [b, c].into_iter().collect(),
            active: HashSet::new(),
        });
        assert_eq!(second.acquired, vec![c]);
        assert_eq!(second.released, vec![a]);

        let mut held = t.release_all();
        held.sort();
        assert_eq!(held, vec![b, c]);
    }

    #[test]
    fn missing_or_broken_body_yields_nothing() {
        let grid = CellGrid::new(8);
        let cfg = TrackerConfig::default();
        let t = ObjectTracker::new(BodyId(2));
        assert!(t.update(&Fixed(None), &grid, &cfg).is_none());
        assert!(t.update(&at(Vec3::splat(f32::NAN), Vec3::ZERO), &grid, &cfg).is_none());
    }

    #[test]
    fn fast_body_reaches_only_max_lookahead_ahead() {
        let grid = CellGrid::new(16);
        let cfg = TrackerConfig::default();
        let t = ObjectTracker::new(BodyId(3));
        let cells = t
            .update(&at(Vec3::splat(8.0), Vec3::splat(1500.0)), &grid, &cfg)
            .unwrap();
        // 8 +- 0.5, swept at most 16 / sqrt(3) per axis, plus the 8 voxel margin.
        assert!(cells.resident.len() <= 27, "{} cells", cells.resident.len());
        assert!(cells.resident.contains(&CellCoord::new(1, 1, 1).key()));
        assert!(!cells.resident.contains(&CellCoord::new(2, 2, 2).key()));
    }

    #[test]
    fn oversized_body_keeps_previous_cells() {
        let grid = CellGrid::new(16);
        let cfg = TrackerConfig::default();
        let t = ObjectTracker::new(BodyId(4));
        let huge = Fixed(Some(BodySample {
            bounds: Aabb::new(Vec3::splat(-1e9), Vec3::splat(1e9)),
            velocity: Vec3::ZERO,
        }));
        assert!(t.update(&huge, &grid, &cfg).is_none());

        let wide = Fixed(Some(BodySample {
            bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(200.0)),
            velocity: Vec3::ZERO,
        }));
        let small = TrackerConfig {
            max_cells_per_body: 64,
            ..TrackerConfig::default()
        };
        assert!(t.update(&wide, &grid, &small).is_none());
    }
}
