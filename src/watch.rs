use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, unbounded};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::TerrainConfig;

/// Reloads `strata.toml` when it changes on disk.
pub struct ConfigWatcher {
    path: PathBuf,
    rx: Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> notify::Result<Self> {
        let (tx, rx) = unbounded::<()>();
        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) | EventKind::Any => {
                        let _ = tx.send(());
                    }
                    _ => {}
                }
            }
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        log::info!("watching {} for config changes", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            rx,
            _watcher: watcher,
        })
    }

    /// Coalesces pending change notifications into one reload. A file that
    /// fails to parse is logged and skipped; the running config stays.
    pub fn poll(&self) -> Option<TerrainConfig> {
        if self.rx.try_iter().count() == 0 {
            return None;
        }
        match TerrainConfig::load_from_path(&self.path) {
            Ok(cfg) => {
                log::info!("reloaded {}", self.path.display());
                Some(cfg)
            }
            Err(e) => {
                log::warn!("config reload failed for {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
