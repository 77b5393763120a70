use std::path::Path;

use serde::Deserialize;
use strata_runtime::RuntimeConfig;
use strata_sched::{SchedulerConfig, TrackerConfig};
use strata_shape::DEFAULT_MAX_BOXES;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Contents of `strata.toml`. Every section and field is optional.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TerrainConfig {
    #[serde(default)]
    pub cell: CellSection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub shape: ShapeSection,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CellSection {
    #[serde(default = "default_cell_size")]
    pub size: usize,
}
fn default_cell_size() -> usize {
    16
}
impl Default for CellSection {
    fn default() -> Self {
        Self {
            size: default_cell_size(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShapeSection {
    #[serde(default = "default_max_boxes")]
    pub max_boxes: usize,
}
fn default_max_boxes() -> usize {
    DEFAULT_MAX_BOXES
}
impl Default for ShapeSection {
    fn default() -> Self {
        Self {
            max_boxes: default_max_boxes(),
        }
    }
}

impl TerrainConfig {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut cfg: TerrainConfig = toml::from_str(s)?;
        cfg.cell.size = cfg.cell.size.clamp(1, usize::from(u16::MAX));
        Ok(cfg)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            log::info!("{} not found; using default terrain config", path.display());
            Ok(Self::default())
        }
    }
}
