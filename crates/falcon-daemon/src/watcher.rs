//! File watcher - marks graph nodes dirty when their file changes
//!
//! Uses the notify crate (inotify on Linux, FSEvents on macOS). The daemon
//! drains it periodically; changed paths that are known graph nodes get
//! marked out of date, everything else is ignored.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use falcon_core::error::FalconError;

use crate::daemon::DaemonInstance;

/// Recursive watcher over the working directory.
pub struct FileWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    receiver: Option<Receiver<Result<Event, notify::Error>>>,
    ignore_dirs: Vec<String>,
}

impl FileWatcher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            watcher: None,
            receiver: None,
            ignore_dirs: vec![".falcon".to_string(), ".git".to_string()],
        }
    }

    /// Start watching the working directory.
    pub fn start(&mut self) -> Result<()> {
        let (tx, rx) = channel();
        let config = Config::default().with_poll_interval(Duration::from_millis(100));
        let mut watcher = RecommendedWatcher::new(tx, config)?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        self.watcher = Some(watcher);
        self.receiver = Some(rx);
        info!("File watcher started for: {:?}", self.root);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.watcher = None;
        self.receiver = None;
    }

    fn ignored(&self, path: &Path) -> bool {
        path.components().any(|c| {
            matches!(c, std::path::Component::Normal(name)
                if self.ignore_dirs.iter().any(|d| name.to_string_lossy() == *d))
        })
    }

    /// Drain pending events into working-directory-relative paths.
    pub fn poll(&self) -> Vec<String> {
        let mut changed = Vec::new();
        let Some(rx) = &self.receiver else {
            return changed;
        };
        while let Ok(result) = rx.try_recv() {
            match result {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Remove(_)
                    ) {
                        continue;
                    }
                    for path in event.paths {
                        if self.ignored(&path) {
                            continue;
                        }
                        let Ok(relative) = path.strip_prefix(&self.root) else {
                            continue;
                        };
                        debug!("file change: {:?}", relative);
                        changed.push(relative.to_string_lossy().to_string());
                    }
                }
                Err(err) => warn!("watch error: {:?}", err),
            }
        }
        changed
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll the watcher until shutdown, marking changed known nodes dirty.
pub async fn run(daemon: Arc<DaemonInstance>, watcher: FileWatcher) {
    let mut shutdown = daemon.shutdown_signal();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                for path in watcher.poll() {
                    match daemon.set_dirty(&path) {
                        Ok(()) => info!("marked {} out of date", path),
                        Err(FalconError::TargetNotFound(_)) => {}
                        Err(err) => warn!("marking {} dirty: {}", path, err),
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
