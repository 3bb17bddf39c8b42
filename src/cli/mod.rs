// CLI command implementations

pub mod clear;
pub mod fields;
pub mod legacy;
pub mod query;
pub mod refresh;
pub mod stats;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use crate::config::Config;
use crate::index::store::CacheStore;
use crate::refresh::pool::WorkerCommand;
use crate::refresh::{RefreshCoordinator, RefreshOptions};

/// A project directory with its configuration loaded
pub struct Project {
    pub dir: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn open(project: &str) -> Result<Self> {
        let dir = PathBuf::from(project);
        if !dir.is_dir() {
            anyhow::bail!("Project directory {} does not exist", dir.display());
        }
        let config = Config::from_project_dir(&dir);
        Ok(Self { dir, config })
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions::from_config(&self.config, &self.dir)
    }

    pub fn open_store(&self) -> CacheStore {
        CacheStore::open(self.refresh_options().cache_dir)
    }

    /// Coordinator whose workers are this binary's `worker` subcommand
    pub fn coordinator(&self) -> Result<RefreshCoordinator> {
        let options = self.refresh_options();
        let store = Arc::new(RwLock::new(CacheStore::open(&options.cache_dir)));
        let command = WorkerCommand::current_exe().context("Cannot start refresh workers")?;
        Ok(RefreshCoordinator::new(store, options, command))
    }
}
