//! Config file watcher.
//!
//! Watches the directory holding the config file and notifies the engine
//! when the config file or one of the env files changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{LoaderError, Result};

/// Quiet period before a burst of file events is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConfigWatcher {
    dir: PathBuf,
    paths: HashSet<PathBuf>,
    change_tx: mpsc::Sender<()>,
}

impl ConfigWatcher {
    pub fn new(dir: PathBuf, paths: Vec<PathBuf>, change_tx: mpsc::Sender<()>) -> Self {
        Self {
            dir,
            paths: paths.into_iter().collect(),
            change_tx,
        }
    }

    /// Whether any event in the batch touches a watched file.
    fn is_relevant(&self, events: &[DebouncedEvent]) -> bool {
        events.iter().any(|event| {
            event.kind == DebouncedEventKind::Any && self.matches(&event.path)
        })
    }

    fn matches(&self, path: &Path) -> bool {
        if self.paths.contains(path) {
            return true;
        }
        // Events may report the directory through a different spelling
        // (symlinks, relative base); compare by file name within it.
        match path.file_name() {
            Some(name) => self.paths.iter().any(|p| {
                p.file_name() == Some(name) && p.parent() == Some(self.dir.as_path())
            }),
            None => false,
        }
    }

    /// Run until the engine's change channel closes.
    pub async fn run(self) -> Result<()> {
        let (watcher_tx, watcher_rx) = std_mpsc::channel();
        let mut debouncer =
            new_debouncer(DEBOUNCE, watcher_tx).map_err(|e| LoaderError::Watcher(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| LoaderError::Watcher(e.to_string()))?;

        info!("Watching {:?} for config changes", self.dir);

        let (async_tx, mut async_rx) = mpsc::channel::<Vec<DebouncedEvent>>(32);
        tokio::task::spawn_blocking(move || {
            loop {
                match watcher_rx.recv() {
                    Ok(Ok(events)) => {
                        if async_tx.blocking_send(events).is_err() {
                            break;
                        }
                    }
                    Ok(Err(error)) => warn!("File watcher error: {:?}", error),
                    Err(_) => break,
                }
            }
            // Keep the debouncer alive as long as the bridge runs
            drop(debouncer);
        });

        while let Some(events) = async_rx.recv().await {
            if !self.is_relevant(&events) {
                continue;
            }
            debug!("Config change detected");
            match self.change_tx.try_send(()) {
                // A queued notification already covers this change
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Change channel closed, stopping config watcher");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Spawn a watcher for `paths`, all of which live in `dir`.
pub fn spawn_config_watcher(
    dir: PathBuf,
    paths: Vec<PathBuf>,
    change_tx: mpsc::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let watcher = ConfigWatcher::new(dir, paths, change_tx);
    tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            warn!("Config watcher stopped: {}", e);
        }
    })
}
