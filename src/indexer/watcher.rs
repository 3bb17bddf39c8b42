// File watcher for incremental updates

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::parser::is_source_file;
use crate::config::PackagesConfig;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};

/// What a changed path asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTrigger {
    /// An extracted source file changed: update the field index
    Sources,
    /// A package appeared, changed or vanished: run a refresh
    Packages,
}

/// Paths the watcher cares about
#[derive(Debug, Clone)]
pub struct WatchTargets {
    pub src_dir: PathBuf,
    pub package_dirs: Vec<PathBuf>,
    pub packages: PackagesConfig,
}

impl WatchTargets {
    pub fn classify(&self, path: &Path) -> Option<WatchTrigger> {
        if path.starts_with(&self.src_dir) && is_source_file(path) {
            return Some(WatchTrigger::Sources);
        }
        let in_package_dir = path
            .parent()
            .is_some_and(|parent| self.package_dirs.iter().any(|d| d == parent));
        if in_package_dir && self.packages.is_package_file(path) {
            return Some(WatchTrigger::Packages);
        }
        None
    }
}

/// Triggers collected during one debounce window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub sources: bool,
    pub packages: bool,
}

impl PendingWork {
    pub fn record(&mut self, trigger: WatchTrigger) {
        match trigger {
            WatchTrigger::Sources => self.sources = true,
            WatchTrigger::Packages => self.packages = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.sources && !self.packages
    }

    pub fn take(&mut self) -> PendingWork {
        std::mem::take(self)
    }
}

/// File watcher for automatic refreshes
pub struct FileWatcher {
    coordinator: Arc<RefreshCoordinator>,
    targets: WatchTargets,
    debounce: Duration,
}

impl FileWatcher {
    /// Create a new file watcher
    pub fn new(coordinator: Arc<RefreshCoordinator>, debounce: Duration) -> Self {
        let options = coordinator.options();
        let targets = WatchTargets {
            src_dir: options.src_dir.clone(),
            package_dirs: options.package_dirs.clone(),
            packages: options.packages.clone(),
        };
        Self {
            coordinator,
            targets,
            debounce,
        }
    }

    /// Start watching for file changes
    pub async fn watch(&self) -> Result<()> {
        // Create a channel for file events
        let (tx, mut rx) = mpsc::unbounded_channel();

        // notify calls back on its own thread
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        debug!("File event dropped, watcher is shutting down");
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            Config::default(),
        )?;

        let mut watched = 0;
        let dirs = std::iter::once(&self.targets.src_dir).chain(self.targets.package_dirs.iter());
        for dir in dirs {
            if !dir.is_dir() {
                warn!("Not watching {}: directory does not exist", dir.display());
                continue;
            }
            watcher.watch(dir, RecursiveMode::Recursive)?;
            info!("Watching {}", dir.display());
            watched += 1;
        }
        if watched == 0 {
            return Err(anyhow::anyhow!("None of the watched directories exist"));
        }

        info!("File watcher started. Monitoring for changes...");

        let mut pending = PendingWork::default();
        loop {
            let next = if pending.is_empty() {
                Ok(rx.recv().await)
            } else {
                tokio::time::timeout(self.debounce, rx.recv()).await
            };

            match next {
                Ok(Some(event)) => self.handle_event(&event, &mut pending),
                Ok(None) => break,
                // Quiet for a full debounce window
                Err(_) => self.flush(pending.take()).await,
            }
        }

        Ok(())
    }

    /// Handle a file system event
    fn handle_event(&self, event: &Event, pending: &mut PendingWork) {
        debug!("File event: {:?}", event);

        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in &event.paths {
            if let Some(trigger) = self.targets.classify(path) {
                debug!("{:?} change: {}", trigger, path.display());
                pending.record(trigger);
            }
        }
    }

    async fn flush(&self, work: PendingWork) {
        if work.packages {
            info!("Package change detected, refreshing");
            match self.coordinator.refresh().await {
                RefreshOutcome::Completed(report) => info!(
                    "Refresh committed {} objects and {} procedures",
                    report.object_count, report.procedure_count
                ),
                RefreshOutcome::AlreadyRunning => info!("Refresh already running, change will be picked up next time"),
            }
        } else if work.sources {
            info!("Source change detected, updating field index");
            match self.coordinator.update_field_cache(None).await {
                Ok(index) => info!("Field index now covers {} tables", index.table_fields.len()),
                Err(e) => error!("Field index update failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> WatchTargets {
        WatchTargets {
            src_dir: PathBuf::from("/p/.alcache/src"),
            package_dirs: vec![PathBuf::from("/p/.alpackages")],
            packages: PackagesConfig::default(),
        }
    }

    #[test]
    fn test_classify() {
        let targets = targets();
        assert_eq!(
            targets.classify(Path::new("/p/.alcache/src/Base/1.0/Customer.Table.al")),
            Some(WatchTrigger::Sources)
        );
        assert_eq!(
            targets.classify(Path::new("/p/.alpackages/Microsoft_Base_1.0.app")),
            Some(WatchTrigger::Packages)
        );
        assert_eq!(targets.classify(Path::new("/p/.alpackages/notes.txt")), None);
        assert_eq!(targets.classify(Path::new("/p/.alpackages/old/Microsoft_Base_1.0.app")), None);
        assert_eq!(targets.classify(Path::new("/p/app/Customer.Table.al")), None);
    }

    #[test]
    fn test_pending_work() {
        let mut pending = PendingWork::default();
        assert!(pending.is_empty());

        pending.record(WatchTrigger::Sources);
        pending.record(WatchTrigger::Sources);
        pending.record(WatchTrigger::Packages);
        let work = pending.take();
        assert!(work.sources && work.packages);
        assert!(pending.is_empty());
    }
}
