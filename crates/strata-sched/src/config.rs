use std::time::Duration;

use serde::Deserialize;

/// Pass cadence, admission throttle and reclamation timing.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,
    /// Snapshot requests handed to the world thread per pass.
    #[serde(default = "default_max_snapshots_per_pass")]
    pub max_snapshots_per_pass: usize,
    /// Passes a cell must stay unreferenced before it is removed.
    #[serde(default = "default_removal_grace_passes")]
    pub removal_grace_passes: u64,
    /// Passes to wait before retrying a cell the world could not snapshot.
    #[serde(default = "default_retry_after_passes")]
    pub retry_after_passes: u64,
    /// 0 runs tracker updates on the global rayon pool.
    #[serde(default)]
    pub tracker_threads: usize,
}

fn default_pass_interval_ms() -> u64 {
    50
}
fn default_max_snapshots_per_pass() -> usize {
    32
}
fn default_removal_grace_passes() -> u64 {
    1
}
fn default_retry_after_passes() -> u64 {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_ms: default_pass_interval_ms(),
            max_snapshots_per_pass: default_max_snapshots_per_pass(),
            removal_grace_passes: default_removal_grace_passes(),
            retry_after_passes: default_retry_after_passes(),
            tracker_threads: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms.max(1))
    }
}

/// Margins, in voxels, around each tracked body.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_load_margin")]
    pub load_margin: f32,
    #[serde(default = "default_activation_margin")]
    pub activation_margin: f32,
    /// How far ahead along the velocity the resident region reaches.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: f32,
    /// Cap on the look-ahead distance, whatever the body's speed.
    #[serde(default = "default_max_lookahead")]
    pub max_lookahead: f32,
    /// A body whose region would cover more cells than this keeps its
    /// previous cells instead.
    #[serde(default = "default_max_cells_per_body")]
    pub max_cells_per_body: usize,
}

fn default_load_margin() -> f32 {
    8.0
}
fn default_activation_margin() -> f32 {
    2.0
}
fn default_lookahead_secs() -> f32 {
    0.5
}
fn default_max_lookahead() -> f32 {
    16.0
}
fn default_max_cells_per_body() -> usize {
    4096
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            load_margin: default_load_margin(),
            activation_margin: default_activation_margin(),
            lookahead_secs: default_lookahead_secs(),
            max_lookahead: default_max_lookahead(),
            max_cells_per_body: default_max_cells_per_body(),
        }
    }
}
