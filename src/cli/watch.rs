use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::Project;
use crate::indexer::watcher::FileWatcher;
use crate::refresh::RefreshOutcome;

/// Optionally refresh once, then watch sources and packages until interrupted.
pub async fn watch_project(project: String, initial_refresh: bool) -> Result<()> {
    let project = Project::open(&project)?;
    let debounce = Duration::from_millis(project.config.watch.debounce_ms);
    let coordinator = Arc::new(project.coordinator()?);
    std::fs::create_dir_all(&coordinator.options().src_dir)?;

    if initial_refresh {
        if let RefreshOutcome::Completed(report) = coordinator.refresh().await {
            info!("Initial refresh: {} objects", report.object_count);
        }
    }

    let watcher = FileWatcher::new(coordinator.clone(), debounce);
    let result = tokio::select! {
        result = watcher.watch() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping watcher");
            Ok(())
        }
    };
    coordinator.shutdown().await;
    result
}
