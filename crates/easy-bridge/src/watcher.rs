//! Hot reload of the bridge configuration
//!
//! Watches the config file's directory (the file itself may not exist yet, or
//! be replaced by an editor's rename) and restarts the whole bridge set when
//! the file is added, changed or removed.

use crate::manager::BridgeManager;
use easy_core::{Error, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Quiet period before a burst of events triggers one restart
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// Keeps the OS watch and the restart task alive
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    path: PathBuf,
}

impl ConfigWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Restart `manager`'s bridges whenever `path` changes
pub fn watch_bridge_config(manager: Arc<BridgeManager>, path: PathBuf) -> Result<ConfigWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .map(|f| f.to_os_string())
        .ok_or_else(|| Error::config(format!("bridge config path {} has no file name", path.display())))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                let _ = tx.send(());
            }
        }
        Err(e) => error!("Bridge config watcher error: {}", e),
    })
    .map_err(|e| Error::config(format!("failed to create config watcher: {}", e)))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::config(format!("failed to watch {}: {}", dir.display(), e)))?;
    info!(path = %path.display(), "Watching bridge config");

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Collapse the burst an editor save produces
            loop {
                match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            debug!("Bridge config changed");
            let count = manager.restart_bridges().await;
            if count == 0 {
                warn!("No bridges running after config reload");
            }
        }
    });

    Ok(ConfigWatcher {
        _watcher: watcher,
        task,
        path,
    })
}
