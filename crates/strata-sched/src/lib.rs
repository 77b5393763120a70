//! Decides which terrain cells must exist, be built and be active.
//!
//! The [`TerrainScheduler`] runs on its own thread. Each pass it joins the
//! object trackers, turns reference-count edges into load and unload
//! decisions, diffs the activation set, and admits a bounded batch of
//! snapshot requests for the world thread. The world thread fulfils those
//! through [`SnapshotService`] and hands snapshots to the build lanes.
#![forbid(unsafe_code)]

mod config;
mod context;
mod event;
mod intent;
mod scheduler;
mod snapshot;
mod tracker;

pub use config::{SchedulerConfig, TrackerConfig};
pub use context::TerrainContext;
pub use event::{SchedulerEvent, SchedulerHandle};
pub use intent::{IntentSet, PendingRequest, Priority};
pub use scheduler::{PassReport, TerrainScheduler};
pub use snapshot::{SnapshotError, SnapshotProvider, SnapshotService, SnapshotStats};
pub use tracker::{BodyId, BodyProbe, BodySample, ObjectTracker, TrackedCells, TrackerDiff};

use strata_store::StoreError;

/// Fatal scheduler failures. Everything recoverable is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("terrain store failure: {0}")]
    Store(#[from] StoreError),
}
