// Configuration management for alcache

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".alcache.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub packages: PackagesConfig,
    pub cache: CacheConfig,
    pub extraction: ExtractionConfig,
    pub workers: WorkersConfig,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub root: String,
}

/// Where compiled packages are discovered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    pub paths: Vec<String>,
    pub extensions: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
    /// Defaults to a directory under the system temp dir
    pub scratch_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub enable_src_extraction: bool,
    pub src_path: String,
    pub extract_procedures: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-project".to_string(),
            root: ".".to_string(),
        }
    }
}

impl PackagesConfig {
    /// True when `path` has a package extension and matches no exclude pattern
    pub fn is_package_file(&self, path: &Path) -> bool {
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if !has_extension {
            return false;
        }

        let path_str = path.to_string_lossy().replace('\\', "/");
        !self
            .exclude
            .iter()
            .any(|pattern| matches_pattern(&path_str, pattern))
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            paths: vec![".alpackages".to_string()],
            extensions: vec!["app".to_string()],
            exclude: vec![],
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: ".alcache".to_string(),
            scratch_path: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enable_src_extraction: true,
            src_path: ".alcache/src".to_string(),
            extract_procedures: true,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
        }
    }
}

pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
pub const LOG_FORMATS: [&str; 2] = ["compact", "full"];

/// Absolute locations derived from a [`Config`] and the project directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub package_dirs: Vec<PathBuf>,
    pub cache_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub src_dir: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from project directory
    /// Looks for .alcache.toml in the project root
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::debug!("Could not load config from {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Resolve every configured path against `project_dir`.
    pub fn resolve<P: AsRef<Path>>(&self, project_dir: P) -> ResolvedPaths {
        let base = std::path::absolute(project_dir.as_ref()).unwrap_or_else(|_| project_dir.as_ref().to_path_buf());
        let project_root = join_relative(&base, &self.project.root);
        let scratch_dir = match &self.cache.scratch_path {
            Some(path) => join_relative(&project_root, path),
            None => std::env::temp_dir().join("alcache-scratch"),
        };

        ResolvedPaths {
            package_dirs: self
                .packages
                .paths
                .iter()
                .map(|p| join_relative(&project_root, p))
                .collect(),
            cache_dir: join_relative(&project_root, &self.cache.path),
            src_dir: join_relative(&project_root, &self.extraction.src_path),
            scratch_dir,
            project_root,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate project settings
        if self.project.name.is_empty() {
            return Err(anyhow::anyhow!("Project name cannot be empty"));
        }

        // Validate package discovery
        if self.packages.paths.is_empty() {
            return Err(anyhow::anyhow!("At least one package path is required"));
        }
        if self.packages.extensions.is_empty() {
            return Err(anyhow::anyhow!("At least one package extension is required"));
        }

        // Validate cache and extraction paths
        if self.cache.path.is_empty() {
            return Err(anyhow::anyhow!("Cache path cannot be empty"));
        }
        if self.extraction.enable_src_extraction && self.extraction.src_path.is_empty() {
            return Err(anyhow::anyhow!("Source extraction path cannot be empty"));
        }

        // Validate worker pool
        if self.workers.max_concurrent == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.watch.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Watch debounce must be greater than 0"));
        }

        // Validate logging
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        Ok(())
    }
}

fn join_relative(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Simple pattern matching (supports glob-style patterns)
fn matches_pattern(file_path: &str, pattern: &str) -> bool {
    if pattern.ends_with('/') {
        // Directory pattern
        file_path.starts_with(pattern) || file_path.contains(&format!("/{}", pattern.trim_end_matches('/')))
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        file_path.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        file_name_of(file_path).starts_with(prefix)
    } else {
        // Exact file name or path fragment
        file_name_of(file_path) == pattern || file_path.contains(pattern)
    }
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
