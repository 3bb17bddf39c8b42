// Refresh coordination: one worker per package, bounded fan-out, merge and commit

pub mod pool;
pub mod protocol;
pub mod worker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, PackagesConfig};
use crate::error::{WorkerError, WorkerResult, NOT_AN_ARCHIVE};
use crate::index::field_cache::FieldIndex;
use crate::index::store::CacheStore;
use crate::index::{AppArtifact, ObjectRecord, ProcedureRecord};
use crate::indexer::extract::has_extracted_sources;
use pool::{FieldIndexWorker, WorkerCommand, WorkerProcess};
use protocol::{FieldCacheOptions, ProcessOptions, Request, Response};

/// Everything a refresh needs, already resolved to absolute paths
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub packages: PackagesConfig,
    pub package_dirs: Vec<PathBuf>,
    pub cache_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub src_dir: PathBuf,
    pub enable_src_extraction: bool,
    pub extract_procedures: bool,
    pub max_concurrent: usize,
    pub log_level: String,
}

impl RefreshOptions {
    pub fn from_config(config: &Config, project_dir: &Path) -> Self {
        let paths = config.resolve(project_dir);
        Self {
            packages: config.packages.clone(),
            package_dirs: paths.package_dirs,
            cache_dir: paths.cache_dir,
            scratch_dir: paths.scratch_dir,
            src_dir: paths.src_dir,
            enable_src_extraction: config.extraction.enable_src_extraction,
            extract_procedures: config.extraction.extract_procedures,
            max_concurrent: config.workers.max_concurrent,
            log_level: config.logging.level.clone(),
        }
    }
}

/// Lifecycle of one package within a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactState {
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl ArtifactState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactState::Skipped | ArtifactState::Succeeded | ArtifactState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Pending => "pending",
            ArtifactState::Skipped => "skipped",
            ArtifactState::Running => "running",
            ArtifactState::Succeeded => "succeeded",
            ArtifactState::Failed => "failed",
        }
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published to the optional event callback while a refresh runs
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    Started {
        total: usize,
    },
    AlreadyRunning,
    StateChanged {
        artifact: PathBuf,
        state: ArtifactState,
    },
    Progress {
        artifact: PathBuf,
        message: String,
    },
    Warning {
        artifact: PathBuf,
        message: String,
    },
    /// `benign` marks the expected non-archive case
    Error {
        artifact: PathBuf,
        message: String,
        benign: bool,
    },
    Committed {
        objects: usize,
        procedures: usize,
    },
}

pub type EventCallback = Arc<dyn Fn(RefreshEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactReport {
    pub artifact: AppArtifact,
    pub state: ArtifactState,
    pub error: Option<String>,
    pub benign: bool,
    pub objects: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub artifacts: Vec<ArtifactReport>,
    pub object_count: usize,
    pub procedure_count: usize,
    pub duration: Duration,
}

impl RefreshReport {
    pub fn count(&self, state: ArtifactState) -> usize {
        self.artifacts.iter().filter(|a| a.state == state).count()
    }

    pub fn state_of(&self, file_name: &str) -> Option<ArtifactState> {
        self.artifacts
            .iter()
            .find(|a| a.artifact.file_name() == file_name)
            .map(|a| a.state)
    }

    /// Failed artifacts, benign ones included
    pub fn errors(&self) -> impl Iterator<Item = &ArtifactReport> {
        self.artifacts.iter().filter(|a| a.state == ArtifactState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    AlreadyRunning,
}

/// Result of one worker exchange
enum WorkerOutcome {
    Succeeded {
        symbols: Vec<ObjectRecord>,
        procedures: BTreeMap<String, Vec<ProcedureRecord>>,
    },
    Failed {
        message: String,
        benign: bool,
    },
}

/// Clears the in-progress flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Every package file directly inside `dirs`, sorted by path.
pub fn discover_artifacts(dirs: &[PathBuf], packages: &PackagesConfig) -> Vec<AppArtifact> {
    let mut artifacts: Vec<AppArtifact> = dirs
        .iter()
        .filter(|dir| {
            let exists = dir.is_dir();
            if !exists {
                debug!("Package directory {} does not exist", dir.display());
            }
            exists
        })
        .flat_map(|dir| {
            WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
        })
        .filter(|e| e.file_type().is_file() && packages.is_package_file(e.path()))
        .filter_map(|e| AppArtifact::from_path(e.path()))
        .collect();
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts.dedup_by(|a, b| a.path == b.path);
    artifacts
}

/// Drives per-package workers and commits their merged output to the store.
pub struct RefreshCoordinator {
    store: Arc<RwLock<CacheStore>>,
    options: RefreshOptions,
    command: WorkerCommand,
    running: AtomicBool,
    log_level: RwLock<String>,
    field_worker: FieldIndexWorker,
    on_event: Option<EventCallback>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<RwLock<CacheStore>>, options: RefreshOptions, command: WorkerCommand) -> Self {
        Self {
            store,
            log_level: RwLock::new(options.log_level.clone()),
            field_worker: FieldIndexWorker::new(command.clone()),
            options,
            command,
            running: AtomicBool::new(false),
            on_event: None,
        }
    }

    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn store(&self) -> &Arc<RwLock<CacheStore>> {
        &self.store
    }

    pub fn options(&self) -> &RefreshOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn emit(&self, event: RefreshEvent) {
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    /// Level used by workers started from now on; also forwarded to the field
    /// index worker if it is running.
    pub async fn set_log_level(&self, level: &str) {
        *self.log_level.write() = level.to_string();
        if let Err(e) = self.field_worker.set_log_level(level).await {
            warn!("Could not forward log level to field index worker: {}", e);
        }
    }

    fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            cache_path: self.options.cache_dir.clone(),
            extract_path: self.options.scratch_dir.clone(),
            enable_src_extraction: self.options.enable_src_extraction,
            src_extraction_path: Some(self.options.src_dir.clone()),
            log_level: self.log_level.read().clone(),
            extract_procedures: self.options.extract_procedures,
        }
    }

    /// Refresh every discovered package. A second call while one is active
    /// returns [`RefreshOutcome::AlreadyRunning`] without doing anything.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            info!("Refresh already in progress");
            self.emit(RefreshEvent::AlreadyRunning);
            return RefreshOutcome::AlreadyRunning;
        };

        let started = Instant::now();
        let artifacts = discover_artifacts(&self.options.package_dirs, &self.options.packages);
        info!("Refreshing {} packages", artifacts.len());
        self.emit(RefreshEvent::Started {
            total: artifacts.len(),
        });

        let mut reports: Vec<ArtifactReport> = artifacts
            .into_iter()
            .map(|artifact| ArtifactReport {
                artifact,
                state: ArtifactState::Pending,
                error: None,
                benign: false,
                objects: 0,
            })
            .collect();

        // A package is only skipped while the cache still holds what it produced;
        // otherwise a cleared or failed cache would never be refilled.
        let cached_apps: HashSet<String> = self
            .store
            .read()
            .objects()
            .values()
            .filter_map(|o| o.app.clone())
            .collect();

        let mut skipped_apps = HashSet::new();
        let mut pending = Vec::new();
        for (idx, report) in reports.iter_mut().enumerate() {
            if self.options.enable_src_extraction
                && cached_apps.contains(&report.artifact.file_name())
                && has_extracted_sources(&report.artifact, &self.options.src_dir)
            {
                debug!("Skipping {}: sources already extracted", report.artifact.path.display());
                report.state = ArtifactState::Skipped;
                skipped_apps.insert(report.artifact.file_name());
                self.emit(RefreshEvent::StateChanged {
                    artifact: report.artifact.path.clone(),
                    state: ArtifactState::Skipped,
                });
            } else {
                pending.push((idx, report.artifact.clone()));
            }
        }

        // Objects of skipped packages carry over from the previous snapshot.
        let mut objects: HashMap<String, ObjectRecord> = self
            .store
            .read()
            .objects()
            .values()
            .filter(|o| o.app.as_ref().is_some_and(|app| skipped_apps.contains(app)))
            .map(|o| (o.name.clone(), o.clone()))
            .collect();
        let mut procedures = BTreeMap::new();

        let semaphore = Semaphore::new(self.options.max_concurrent.max(1));
        let semaphore = &semaphore;
        let mut tasks: FuturesUnordered<_> = pending
            .into_iter()
            .map(|(idx, artifact)| async move {
                let _permit = semaphore.acquire().await.ok();
                let outcome = self.run_worker(&artifact).await;
                (idx, outcome)
            })
            .collect();

        let mut succeeded_any = false;
        while let Some((idx, outcome)) = tasks.next().await {
            let report = &mut reports[idx];
            match outcome {
                WorkerOutcome::Succeeded {
                    symbols,
                    procedures: procs,
                } => {
                    report.state = ArtifactState::Succeeded;
                    report.objects = symbols.len();
                    succeeded_any = true;
                    for record in symbols {
                        objects.insert(record.name.clone(), record);
                    }
                    procedures.extend(procs);
                }
                WorkerOutcome::Failed { message, benign } => {
                    if benign {
                        warn!("{}: {}", report.artifact.file_name(), message);
                    } else {
                        error!("{}: {}", report.artifact.file_name(), message);
                    }
                    self.emit(RefreshEvent::Error {
                        artifact: report.artifact.path.clone(),
                        message: message.clone(),
                        benign,
                    });
                    report.state = ArtifactState::Failed;
                    report.error = Some(message);
                    report.benign = benign;
                }
            }
            self.emit(RefreshEvent::StateChanged {
                artifact: report.artifact.path.clone(),
                state: report.state,
            });
        }
        drop(tasks);

        let (object_count, procedure_count) = {
            let mut store = self.store.write();
            store.replace_objects(objects);
            store.merge_procedures(procedures);
            if let Err(e) = store.save() {
                warn!("Failed to persist symbol cache: {}", e);
            }
            (store.objects().len(), store.procedure_count())
        };
        self.emit(RefreshEvent::Committed {
            objects: object_count,
            procedures: procedure_count,
        });

        if self.options.enable_src_extraction && succeeded_any {
            if let Err(e) = self.update_field_cache(None).await {
                warn!("Field index update after refresh failed: {:#}", e);
            }
        }

        let report = RefreshReport {
            artifacts: reports,
            object_count,
            procedure_count,
            duration: started.elapsed(),
        };
        info!(
            "Refresh finished in {:?}: {} succeeded, {} skipped, {} failed, {} objects",
            report.duration,
            report.count(ArtifactState::Succeeded),
            report.count(ArtifactState::Skipped),
            report.count(ArtifactState::Failed),
            report.object_count
        );
        RefreshOutcome::Completed(report)
    }

    async fn run_worker(&self, artifact: &AppArtifact) -> WorkerOutcome {
        self.emit(RefreshEvent::StateChanged {
            artifact: artifact.path.clone(),
            state: ArtifactState::Running,
        });
        let request = Request::Process {
            app_path: artifact.path.clone(),
            options: self.process_options(),
        };
        match self.exchange(artifact, &request).await {
            Ok(outcome) => outcome,
            Err(e) => WorkerOutcome::Failed {
                message: e.to_string(),
                benign: false,
            },
        }
    }

    /// Spawn, send one request, read until the worker closes stdout.
    async fn exchange(&self, artifact: &AppArtifact, request: &Request) -> WorkerResult<WorkerOutcome> {
        let mut worker = WorkerProcess::spawn(&self.command)?;
        worker.send(request).await?;
        worker.close_stdin();

        let mut terminal = None;
        while let Some(message) = worker.recv().await? {
            match message {
                Response::Progress { message } => {
                    debug!("{}: {}", artifact.file_name(), message);
                    self.emit(RefreshEvent::Progress {
                        artifact: artifact.path.clone(),
                        message,
                    });
                }
                Response::Warning { message } => {
                    warn!("{}: {}", artifact.file_name(), message);
                    self.emit(RefreshEvent::Warning {
                        artifact: artifact.path.clone(),
                        message,
                    });
                }
                Response::Success { symbols, procedures, .. } if terminal.is_none() => {
                    terminal = Some(WorkerOutcome::Succeeded { symbols, procedures });
                }
                Response::Error { message, stack, .. } if terminal.is_none() => {
                    if let Some(stack) = stack {
                        debug!("{} failed: {}", artifact.file_name(), stack);
                    }
                    terminal = Some(WorkerOutcome::Failed {
                        benign: message.contains(NOT_AN_ARCHIVE),
                        message,
                    });
                }
                other => warn!("Ignoring {} message from {}", other.kind(), artifact.file_name()),
            }
        }

        let status = worker.wait().await?;
        terminal.ok_or_else(|| WorkerError::Crashed {
            reason: format!("exited with {} before reporting a result", status),
        })
    }

    /// Rescan extracted sources (all apps, or just `app_name`) through the field
    /// index worker and persist the result.
    pub async fn update_field_cache(&self, app_name: Option<&str>) -> anyhow::Result<FieldIndex> {
        let options = FieldCacheOptions {
            src_extraction_path: self.options.src_dir.clone(),
            global_storage_path: self.options.cache_dir.clone(),
            app_name: app_name.map(str::to_string),
            log_level: self.log_level.read().clone(),
        };
        Ok(self.field_worker.update(options).await?)
    }

    /// Stop the field index worker.
    pub async fn shutdown(&self) {
        self.field_worker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ObjectKind;
    use std::fs;
    use tempfile::tempdir;

    fn options(base: &Path) -> RefreshOptions {
        let mut config = Config::default();
        config.cache.scratch_path = Some("scratch".to_string());
        RefreshOptions::from_config(&config, base)
    }

    #[test]
    fn test_discover_artifacts() {
        let dir = tempdir().unwrap();
        let packages = dir.path().join(".alpackages");
        fs::create_dir_all(packages.join("nested")).unwrap();
        fs::write(packages.join("B_Sales_2.0.app"), b"x").unwrap();
        fs::write(packages.join("A_Base_1.0.app"), b"x").unwrap();
        fs::write(packages.join("notes.txt"), b"x").unwrap();
        fs::write(packages.join("nested/C_Deep_1.0.app"), b"x").unwrap();

        let options = options(dir.path());
        let found = discover_artifacts(&options.package_dirs, &options.packages);
        let names: Vec<String> = found.iter().map(|a| a.file_name()).collect();
        assert_eq!(names, ["A_Base_1.0.app", "B_Sales_2.0.app"]);
        assert_eq!(found[1].app_name, "Sales");

        assert!(discover_artifacts(&[dir.path().join("missing")], &options.packages).is_empty());
    }

    #[test]
    fn test_run_guard() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(RunGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_options_from_config() {
        let dir = tempdir().unwrap();
        let options = options(dir.path());
        assert_eq!(options.max_concurrent, 4);
        assert!(options.cache_dir.ends_with(".alcache"));
        assert!(options.scratch_dir.ends_with("scratch"));
        assert!(options.extract_procedures);
    }

    #[tokio::test]
    async fn test_skip_requires_cached_objects() {
        let dir = tempdir().unwrap();
        let packages = dir.path().join(".alpackages");
        fs::create_dir_all(&packages).unwrap();
        let artifact_path = packages.join("Contoso_Loyalty_1.0.0.0.app");
        fs::write(&artifact_path, b"x").unwrap();

        let options = options(dir.path());
        let artifact = AppArtifact::from_path(&artifact_path).unwrap();
        let sources = artifact.source_dir(&options.src_dir);
        fs::create_dir_all(&sources).unwrap();
        fs::write(sources.join("LoyaltyTier.Table.al"), "table 50100 \"Loyalty Tier\" { }").unwrap();

        let store = Arc::new(RwLock::new(CacheStore::new(&options.cache_dir)));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            options,
            WorkerCommand::new("/nonexistent/alcache", ["worker"]),
        );

        // Sources on disk but nothing cached: the package must be processed again.
        let RefreshOutcome::Completed(report) = coordinator.refresh().await else {
            panic!("refresh should run");
        };
        assert_eq!(report.count(ArtifactState::Skipped), 0);
        assert_eq!(report.count(ArtifactState::Failed), 1);

        let mut tier = ObjectRecord::new(ObjectKind::Table, Some(50100), "Loyalty Tier");
        tier.app = Some(artifact.file_name());
        store
            .write()
            .replace_objects([(tier.name.clone(), tier)].into_iter().collect());

        let RefreshOutcome::Completed(report) = coordinator.refresh().await else {
            panic!("refresh should run");
        };
        assert_eq!(report.count(ArtifactState::Skipped), 1);
        assert_eq!(store.read().get_object_id("Loyalty Tier"), Some(50100));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_isolated() {
        let dir = tempdir().unwrap();
        let packages = dir.path().join(".alpackages");
        fs::create_dir_all(&packages).unwrap();
        fs::write(packages.join("A_Base_1.0.app"), b"x").unwrap();
        fs::write(packages.join("B_Sales_1.0.app"), b"x").unwrap();

        let options = options(dir.path());
        let store = Arc::new(RwLock::new(CacheStore::new(&options.cache_dir)));
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            options,
            WorkerCommand::new("/nonexistent/alcache", ["worker"]),
        )
        .with_event_callback(Arc::new(move |e: RefreshEvent| sink.lock().push(e)));

        let RefreshOutcome::Completed(report) = coordinator.refresh().await else {
            panic!("refresh should run");
        };
        assert_eq!(report.count(ArtifactState::Failed), 2);
        assert!(report.errors().all(|a| !a.benign));
        assert!(!coordinator.is_running());
        assert!(store.read().symbols_path().is_file());

        let events = events.lock();
        let terminal = events
            .iter()
            .filter(|e| matches!(e, RefreshEvent::StateChanged { state, .. } if state.is_terminal()))
            .count();
        assert_eq!(terminal, 2);
        assert!(matches!(events.last(), Some(RefreshEvent::Committed { objects: 0, .. })));
    }
}
